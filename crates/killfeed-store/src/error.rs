/// Errors surfaced by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A required connection parameter is missing from the environment.
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    /// The database rejected a query or the connection failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
