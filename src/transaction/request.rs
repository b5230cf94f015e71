use std::fmt;

/// How a request spreads over the transaction's backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutMode {
    /// One backend, the first by name
    Single,
    /// The same query on every backend
    Scatter,
    /// Explicit (backend, query) tuples
    Normal,
}

/// Read or write intent of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnMode {
    #[default]
    Read,
    Write,
}

/// A query bound to one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTuple {
    pub backend: String,
    pub query: String,
}

impl QueryTuple {
    pub fn new(backend: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            query: query.into(),
        }
    }
}

impl fmt::Display for QueryTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.query)
    }
}

/// A routed request as handed over by the planner.
#[derive(Debug, Clone)]
pub struct Request {
    pub mode: FanoutMode,
    pub txn_mode: TxnMode,
    /// Query for `Single` and `Scatter`
    pub raw_query: String,
    /// Per-backend queries for `Normal`
    pub querys: Vec<QueryTuple>,
    /// Run reads on the backends' replica pools when configured
    pub on_replica: bool,
}

impl Request {
    pub fn single(query: impl Into<String>) -> Self {
        Self {
            mode: FanoutMode::Single,
            txn_mode: TxnMode::Read,
            raw_query: query.into(),
            querys: Vec::new(),
            on_replica: false,
        }
    }

    pub fn scatter(query: impl Into<String>) -> Self {
        Self {
            mode: FanoutMode::Scatter,
            ..Self::single(query)
        }
    }

    pub fn normal(querys: Vec<QueryTuple>) -> Self {
        Self {
            mode: FanoutMode::Normal,
            querys,
            ..Self::single("")
        }
    }

    pub fn write(mut self) -> Self {
        self.txn_mode = TxnMode::Write;
        self
    }

    pub fn read(mut self) -> Self {
        self.txn_mode = TxnMode::Read;
        self
    }

    pub fn on_replica(mut self) -> Self {
        self.on_replica = true;
        self
    }

    pub fn is_write(&self) -> bool {
        self.txn_mode == TxnMode::Write
    }
}
