use super::ChannelError;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Idle,
    Opening,
    Open,
    Closed,
}

/// Single-assignment settlement of a channel's open.
///
/// Whichever of "handshake finished", "handshake failed" or "closed" lands
/// first wins; the losers observe `false` and back off.
#[derive(Debug)]
pub struct OpenGuard {
    phase: Mutex<ChannelPhase>,
}

impl Default for OpenGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenGuard {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(ChannelPhase::Idle),
        }
    }

    pub fn phase(&self) -> ChannelPhase {
        *self.phase.lock()
    }

    pub fn begin(&self) -> Result<(), ChannelError> {
        let mut phase = self.phase.lock();
        match *phase {
            ChannelPhase::Idle => {
                *phase = ChannelPhase::Opening;
                Ok(())
            }
            ChannelPhase::Closed => Err(ChannelError::Cancelled),
            ChannelPhase::Opening | ChannelPhase::Open => Err(ChannelError::AlreadyOpened),
        }
    }

    pub fn settle_open(&self) -> bool {
        self.transition(ChannelPhase::Opening, ChannelPhase::Open)
    }

    pub fn settle_failed(&self) -> bool {
        self.transition(ChannelPhase::Opening, ChannelPhase::Closed)
    }

    /// Returns the phase that was replaced.
    pub fn close(&self) -> ChannelPhase {
        std::mem::replace(&mut *self.phase.lock(), ChannelPhase::Closed)
    }

    fn transition(&self, from: ChannelPhase, to: ChannelPhase) -> bool {
        let mut phase = self.phase.lock();
        if *phase != from {
            return false;
        }
        *phase = to;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_settles_once() {
        let guard = OpenGuard::new();
        guard.begin().unwrap();
        assert!(guard.settle_open());
        assert!(!guard.settle_open());
        assert!(!guard.settle_failed());
        assert_eq!(guard.phase(), ChannelPhase::Open);
    }

    #[test]
    fn close_during_handshake_beats_late_success() {
        let guard = OpenGuard::new();
        guard.begin().unwrap();
        assert_eq!(guard.close(), ChannelPhase::Opening);
        assert!(!guard.settle_open());
        assert_eq!(guard.phase(), ChannelPhase::Closed);
    }

    #[test]
    fn channels_are_single_use() {
        let guard = OpenGuard::new();
        guard.begin().unwrap();
        assert!(matches!(guard.begin(), Err(ChannelError::AlreadyOpened)));
        guard.close();
        assert!(matches!(guard.begin(), Err(ChannelError::Cancelled)));
        assert_eq!(guard.close(), ChannelPhase::Closed);
    }
}
