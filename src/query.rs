use std::fmt;

/// A single SQL statement, sent as text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    text: String,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn render(&self) -> &str {
        &self.text
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Statements sent to the server in one round trip; each produces its own result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiQuery {
    queries: Vec<Query>,
}

impl MultiQuery {
    pub fn new(queries: Vec<Query>) -> Self {
        Self { queries }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    /// Statements joined with `;`, as the server expects with multi-statements enabled
    pub fn render_multi(&self) -> String {
        self.queries
            .iter()
            .map(Query::render)
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl From<Query> for MultiQuery {
    fn from(query: Query) -> Self {
        Self::new(vec![query])
    }
}

impl<Q: Into<Query>> FromIterator<Q> for MultiQuery {
    fn from_iter<I: IntoIterator<Item = Q>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}
