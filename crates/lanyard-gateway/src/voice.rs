use thiserror::Error;
use tokio::time::Instant;

/// Voice lifecycle for one user. Joining covers the window between the
/// join request and the relay reporting the peer connection up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    NotInVoice,
    Joining,
    Active,
    Leaving,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VoiceStateError {
    #[error("invalid voice transition {from:?} -> {to:?}")]
    InvalidTransition { from: VoiceState, to: VoiceState },
    #[error("voice session not active (currently {0:?})")]
    NotActive(VoiceState),
}

/// The legal edges. Everything else, including self-loops, is rejected;
/// the one idempotent case (activate while Active) is handled by the caller
/// checking `state()` first.
pub fn transition_allowed(from: VoiceState, to: VoiceState) -> bool {
    use VoiceState::*;
    matches!(
        (from, to),
        (NotInVoice, Joining)
            | (Joining, Active)
            | (Joining, Leaving)
            | (Active, Leaving)
            | (Leaving, NotInVoice)
    )
}

/// Per-user voice session owned by the hub loop. No interior mutability:
/// all transitions happen on the loop's thread.
#[derive(Debug)]
pub struct VoiceSession {
    state: VoiceState,
    pub muted: bool,
    pub deafened: bool,
    joined_at: Instant,
}

impl VoiceSession {
    pub fn new(muted: bool, deafened: bool) -> Self {
        Self {
            state: VoiceState::NotInVoice,
            muted,
            deafened,
            joined_at: Instant::now(),
        }
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    /// When the join request was accepted. Used by the watchdog to expire
    /// sessions stuck in Joining.
    pub fn joined_at(&self) -> Instant {
        self.joined_at
    }

    fn request(&mut self, to: VoiceState) -> Result<(), VoiceStateError> {
        if !transition_allowed(self.state, to) {
            return Err(VoiceStateError::InvalidTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    pub fn join(&mut self) -> Result<(), VoiceStateError> {
        self.request(VoiceState::Joining)?;
        self.joined_at = Instant::now();
        Ok(())
    }

    /// Relay reported the peer connection up. Idempotent when already Active.
    pub fn activate(&mut self) -> Result<(), VoiceStateError> {
        if self.state == VoiceState::Active {
            return Ok(());
        }
        self.request(VoiceState::Active)
    }

    pub fn begin_leave(&mut self) -> Result<(), VoiceStateError> {
        self.request(VoiceState::Leaving)
    }

    pub fn finish_leave(&mut self) -> Result<(), VoiceStateError> {
        self.request(VoiceState::NotInVoice)
    }

    /// Apply mute/deafen flags. Only meaningful while the session exists on
    /// the relay side, i.e. Joining or Active.
    pub fn set_flags(
        &mut self,
        muted: Option<bool>,
        deafened: Option<bool>,
    ) -> Result<(), VoiceStateError> {
        match self.state {
            VoiceState::Joining | VoiceState::Active => {
                if let Some(muted) = muted {
                    self.muted = muted;
                }
                if let Some(deafened) = deafened {
                    self.deafened = deafened;
                }
                Ok(())
            }
            other => Err(VoiceStateError::NotActive(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VoiceState::*;

    const ALL: [VoiceState; 4] = [NotInVoice, Joining, Active, Leaving];

    #[test]
    fn transition_table_is_exact() {
        for from in ALL {
            for to in ALL {
                let expected = matches!(
                    (from, to),
                    (NotInVoice, Joining)
                        | (Joining, Active)
                        | (Joining, Leaving)
                        | (Active, Leaving)
                        | (Leaving, NotInVoice)
                );
                assert_eq!(
                    transition_allowed(from, to),
                    expected,
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn full_lifecycle() {
        let mut session = VoiceSession::new(false, false);
        session.join().unwrap();
        session.activate().unwrap();
        session.activate().unwrap(); // idempotent
        session.begin_leave().unwrap();
        session.finish_leave().unwrap();
        assert_eq!(session.state(), NotInVoice);
    }

    #[test]
    fn abandoned_join_leaves_through_leaving() {
        let mut session = VoiceSession::new(false, false);
        session.join().unwrap();
        session.begin_leave().unwrap();
        session.finish_leave().unwrap();
        assert_eq!(session.state(), NotInVoice);
    }

    #[test]
    fn flags_rejected_outside_session() {
        let mut session = VoiceSession::new(false, false);
        assert_eq!(
            session.set_flags(Some(true), None),
            Err(VoiceStateError::NotActive(NotInVoice))
        );
        session.join().unwrap();
        session.set_flags(Some(true), Some(true)).unwrap();
        assert!(session.muted && session.deafened);
        session.begin_leave().unwrap();
        assert_eq!(
            session.set_flags(None, Some(false)),
            Err(VoiceStateError::NotActive(Leaving))
        );
    }
}
