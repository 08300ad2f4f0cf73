pub mod connection;
pub mod operations;
pub mod repository;

pub use operations::PostgresRepository;
pub use repository::{MemoryRepository, RepositoryError, WorkoutRepository};
