//! Flow state machine: flowing/paused, ended, destroyed.

/// Delivery state of a stream.
///
/// ```text
///  Flowing <--pause/resume--> Paused
///     |  end                     |  end
///     v                          v
///  EndedFlowing <--pause/resume--> EndedPaused
///     |  queue drained
///     v
///  Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowState {
    #[default]
    Flowing,
    Paused,
    EndedFlowing,
    EndedPaused,
    Destroyed,
}

impl FlowState {
    pub fn initial(paused: bool) -> Self {
        if paused {
            FlowState::Paused
        } else {
            FlowState::Flowing
        }
    }

    /// Stop delivery. Returns `true` if the state changed.
    pub fn pause(&mut self) -> bool {
        let next = match *self {
            FlowState::Flowing => FlowState::Paused,
            FlowState::EndedFlowing => FlowState::EndedPaused,
            _ => return false,
        };
        *self = next;
        true
    }

    /// Restart delivery. Returns `true` if the stream was paused.
    pub fn resume(&mut self) -> bool {
        let next = match *self {
            FlowState::Paused => FlowState::Flowing,
            FlowState::EndedPaused => FlowState::EndedFlowing,
            _ => return false,
        };
        *self = next;
        true
    }

    /// Latch the ended flag, keeping the paused flag as it was.
    pub fn end(&mut self) {
        *self = match *self {
            FlowState::Flowing => FlowState::EndedFlowing,
            FlowState::Paused => FlowState::EndedPaused,
            other => other,
        };
    }

    pub fn destroy(&mut self) {
        *self = FlowState::Destroyed;
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, FlowState::Paused | FlowState::EndedPaused)
    }

    /// True once `end` has been called. A destroyed stream counts as ended.
    pub fn is_ended(&self) -> bool {
        matches!(
            self,
            FlowState::EndedFlowing | FlowState::EndedPaused | FlowState::Destroyed
        )
    }

    pub fn is_destroyed(&self) -> bool {
        *self == FlowState::Destroyed
    }
}
