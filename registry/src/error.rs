use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no such builder: {0}")]
    NoSuchBuilder(String),

    #[error("resource {0:?} not configured")]
    NoSuchResource(String),

    #[error("task db error: {0}")]
    TaskDb(#[from] sai_taskdb::TaskDbError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
