pub mod aggregator;
pub mod database;
pub mod engine;
pub mod error;
pub mod import;
#[cfg(feature = "mongodb")]
pub mod mongo;
pub mod pipeline;
pub mod query;
pub mod stage;
pub mod value;

pub use aggregator::{Aggregator, first_field};
pub use database::{Database, DocumentCursor};
pub use engine::EmbeddedDb;
pub use error::{Error, Result};
pub use import::ImportOptions;
#[cfg(feature = "mongodb")]
pub use mongo::{MongoCursor, MongoDatabase};
pub use stage::{Accumulator, Filter, Group, Projection, ProjectionField};
