use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Cloud API error: {0}")]
    Api(String),
    #[error("queue closed: {0}")]
    QueueClosed(String),
}

/// A value that cannot be mapped onto any column kind.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferError {
    #[error("attribute {name}: unsupported value kind {kind}")]
    Unsupported { name: String, kind: &'static str },
    #[error("attribute {name}: non-finite number {value}")]
    NonFinite { name: String, value: f64 },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("table {0} already exists")]
    AlreadyExists(String),
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("schema change on {table} failed: {reason}")]
    Schema { table: String, reason: String },
    #[error("insert into {table} failed: {reason}")]
    Insert { table: String, reason: String },
    #[error("DB error: {0}")]
    Db(#[from] sqlx::Error),
}

impl StorageError {
    pub fn is_connection_closed(&self) -> bool {
        match self {
            StorageError::ConnectionClosed(_) => true,
            StorageError::Db(e) => is_closed_sqlx(e),
            _ => false,
        }
    }
}

fn is_closed_sqlx(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed | sqlx::Error::Io(_) => true,
        other => {
            let msg = other.to_string().to_lowercase();
            msg.contains("conn closed") || msg.contains("connection closed")
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("envelope: {0}")]
    Envelope(#[source] prost::DecodeError),
    #[error("envelope carries no header")]
    MissingHeader,
    #[error("cmd {cmd_id} payload: {source}")]
    Payload {
        cmd_id: i32,
        #[source]
        source: prost::DecodeError,
    },
}
