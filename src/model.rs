use std::fmt;


/// Идентификатор потока-воркера пула, стабилен всё время жизни воркера
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}


/// Состояние изолированного контекста.
///
/// `UNCREATED` не хранится: это пустой слот воркера.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Initializing = 0,
    Ready = 1,
    Executing = 2,
    Broken = 3,
    Orphaned = 4,
    Destroyed = 5,
}

impl ContextState {
    #[inline]
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ContextState::Initializing,
            1 => ContextState::Ready,
            2 => ContextState::Executing,
            3 => ContextState::Broken,
            4 => ContextState::Orphaned,
            _ => ContextState::Destroyed,
        }
    }

    /// Контекст ещё держит ресурсы рантайма
    #[inline]
    pub fn is_live(self) -> bool {
        !matches!(self, ContextState::Destroyed)
    }
}


#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub workers: usize,
    pub live_contexts: usize,
    pub broken_contexts: usize,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub total_submitted: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
}

impl PoolMetrics {
    pub fn utilization(&self) -> f64 {
        if self.workers == 0 {
            return 0.0;
        }
        self.active_tasks as f64 / self.workers as f64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.completed_tasks + self.failed_tasks;
        if total == 0 {
            return 1.0;
        }
        self.completed_tasks as f64 / total as f64
    }
}


/// Итог shutdown: какие контексты уничтожены, какие оставлены сиротами
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub destroyed: Vec<ContextId>,
    pub orphaned: Vec<ContextId>,
}

impl ShutdownReport {
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty()
    }
}
