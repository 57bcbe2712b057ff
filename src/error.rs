use thiserror::Error;

pub type Result<T> = std::result::Result<T, MicroflowError>;

#[derive(Debug, Error)]
pub enum MicroflowError {
    #[error("expression evaluation failed: {0}")]
    Evaluation(String),
    #[error("task queue exhausted (capacity {capacity})")]
    QueueExhausted { capacity: usize },
    #[error("flow state arena exhausted (capacity {capacity})")]
    ResourceExhausted { capacity: usize },
    #[error("{0}")]
    Logic(String),
    #[error("unknown flow `{0}` in bundle")]
    UnknownFlow(String),
    #[error("unknown component `{0}` in flow")]
    UnknownComponent(String),
    #[error("unknown variable `{0}` in flow")]
    UnknownVariable(String),
    #[error("invalid flow asset: {0}")]
    Asset(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MicroflowError {
    /// 错误类别名称，用于日志与调试回调
    pub fn kind(&self) -> &'static str {
        match self {
            MicroflowError::Evaluation(_) => "evaluation",
            MicroflowError::QueueExhausted { .. } => "queue-exhausted",
            MicroflowError::ResourceExhausted { .. } => "resource-exhausted",
            MicroflowError::Logic(_) => "logic",
            MicroflowError::UnknownFlow(_)
            | MicroflowError::UnknownComponent(_)
            | MicroflowError::UnknownVariable(_)
            | MicroflowError::Asset(_) => "asset",
            MicroflowError::Other(_) => "other",
        }
    }
}
