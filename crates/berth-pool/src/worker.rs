use crate::id::{StartupToken, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Language {
    Python,
    Java,
    Cpp,
}

impl Language {
    pub fn name(&self) -> &'static str {
        match self {
            Language::Python => "PYTHON",
            Language::Java => "JAVA",
            Language::Cpp => "CPP",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerType {
    /// A worker that executes user tasks.
    Task,
    /// An I/O helper that spills objects out of the local object store.
    Spill,
    /// An I/O helper that restores spilled objects.
    Restore,
}

impl WorkerType {
    pub fn is_io(&self) -> bool {
        matches!(self, WorkerType::Spill | WorkerType::Restore)
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerType::Task => "WORKER",
            WorkerType::Spill => "SPILL_WORKER",
            WorkerType::Restore => "RESTORE_WORKER",
        }
    }
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An owned snapshot of a registered worker, handed to consumers when a
/// worker is dispatched. The pool keeps the authoritative state; consumers
/// refer back to the worker by its ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedWorker {
    pub worker_id: WorkerId,
    pub language: Language,
    pub worker_type: WorkerType,
    pub pid: u32,
    pub port: u16,
    pub startup_token: StartupToken,
}
