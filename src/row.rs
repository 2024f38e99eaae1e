/// Column names of a result set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFields {
    names: Vec<String>,
}

impl RowFields {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A row as returned by the backend. Values are raw text protocol bytes; `None` is NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    values: Vec<Option<Vec<u8>>>,
}

impl Row {
    pub fn new(values: Vec<Option<Vec<u8>>>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bytes of the column at `index`, or `None` when it is NULL or out of range
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(None))
    }

    /// Payload size of the row, excluding protocol and metadata overhead
    pub fn payload_size(&self) -> u64 {
        self.values
            .iter()
            .map(|v| v.as_ref().map_or(0, Vec::len) as u64)
            .sum()
    }

    pub fn into_values(self) -> Vec<Option<Vec<u8>>> {
        self.values
    }
}

impl<S: AsRef<str>> From<&[S]> for Row {
    fn from(values: &[S]) -> Self {
        Self::new(
            values
                .iter()
                .map(|v| Some(v.as_ref().as_bytes().to_vec()))
                .collect(),
        )
    }
}
