use thiserror::Error;

/// Errors surfaced by the towerec core.
///
/// Parse-level failures (`MalformedRecord`) are recovered per record by the
/// loaders: the line is skipped and counted. Everything else terminates the
/// current operation and is reported to the caller.
#[derive(Error, Debug)]
pub enum RecError {
    #[error("data source {name:?} unavailable: {source}")]
    DataSource {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record at {file}:{line}: {reason}")]
    MalformedRecord {
        file: String,
        line: usize,
        reason: String,
    },

    #[error("no usable {what} after parsing and filtering")]
    EmptyInput { what: &'static str },

    #[error("batch shape mismatch in {context}: {left} vs {right}")]
    BatchShape {
        context: &'static str,
        left: usize,
        right: usize,
    },

    #[error("training diverged: non-finite loss {loss} at epoch {epoch}, batch {batch}")]
    Divergence {
        epoch: usize,
        batch: usize,
        loss: f32,
    },

    #[error("unknown user index {0}")]
    UnknownUser(usize),

    #[error("unknown item index {0}")]
    UnknownItem(usize),

    #[error("model covers {model_items} items but the store holds {store_items}; rebuild the model")]
    StaleModel {
        model_items: usize,
        store_items: usize,
    },
}

pub type Result<T> = std::result::Result<T, RecError>;
