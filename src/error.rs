use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database connection cannot be null")]
    MissingConnection,

    #[error("aggregation cannot be performed due to the lack of some input parameters")]
    IncompleteConfiguration,

    #[error("field not found in aggregation result: {0}")]
    MissingField(String),

    #[error("cannot decode aggregation result: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("duplicate _id: {0}")]
    DuplicateId(String),

    #[error("document must be a JSON object")]
    NotAnObject,

    #[error("no integer _id left to assign")]
    IdsExhausted,

    #[cfg(feature = "mongodb")]
    #[error(transparent)]
    Driver(#[from] mongodb::error::Error),

    #[cfg(feature = "mongodb")]
    #[error("cannot convert stage to bson: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),
}

impl Error {
    /// True for the errors raised by the builder itself before any database
    /// call: a missing connection or an incomplete pipeline.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::MissingConnection | Error::IncompleteConfiguration)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
