use crate::{
    error::{ChatError, ChatErrorCategory},
    types::{ChatCommand, ChatEvent, ChatLifecycleState},
};

/// Runtime lifecycle machine gating command execution.
#[derive(Debug, Clone)]
pub struct ChatStateMachine {
    state: ChatLifecycleState,
}

impl Default for ChatStateMachine {
    fn default() -> Self {
        Self {
            state: ChatLifecycleState::Cold,
        }
    }
}

impl ChatStateMachine {
    pub fn state(&self) -> ChatLifecycleState {
        self.state
    }

    pub fn apply(&mut self, command: &ChatCommand) -> Result<Vec<ChatEvent>, ChatError> {
        use ChatCommand::*;

        match command {
            Init { .. } => self.transition_from_state(
                ChatLifecycleState::Cold,
                ChatLifecycleState::Authenticating,
                "init",
            ),
            Shutdown => self.transition_from_any_of(
                &[
                    ChatLifecycleState::Authenticating,
                    ChatLifecycleState::Ready,
                ],
                ChatLifecycleState::Closed,
                "shutdown",
            ),
            OpenConversation { .. }
            | CloseConversation { .. }
            | SendMessage { .. }
            | LoadOlder { .. }
            | Refresh { .. } => {
                if self.state == ChatLifecycleState::Ready {
                    Ok(Vec::new())
                } else {
                    Err(ChatError::invalid_state(self.state, "conversation command"))
                }
            }
        }
    }

    pub fn on_auth_result(&mut self, success: bool) -> Result<ChatEvent, ChatError> {
        if self.state != ChatLifecycleState::Authenticating {
            return Err(ChatError::invalid_state(self.state, "on_auth_result"));
        }

        // A rejected auth check is fatal to initialization; there is no retry.
        let next = if success {
            ChatLifecycleState::Ready
        } else {
            ChatLifecycleState::Fatal
        };

        self.state = next;
        Ok(ChatEvent::StateChanged { state: next })
    }

    pub fn on_fatal(&mut self) -> ChatEvent {
        self.state = ChatLifecycleState::Fatal;
        ChatEvent::StateChanged {
            state: ChatLifecycleState::Fatal,
        }
    }

    fn transition_from_state(
        &mut self,
        expected: ChatLifecycleState,
        next: ChatLifecycleState,
        action: &str,
    ) -> Result<Vec<ChatEvent>, ChatError> {
        if self.state != expected {
            return Err(ChatError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![ChatEvent::StateChanged { state: next }])
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ChatLifecycleState],
        next: ChatLifecycleState,
        action: &str,
    ) -> Result<Vec<ChatEvent>, ChatError> {
        if !expected.contains(&self.state) {
            return Err(ChatError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![ChatEvent::StateChanged { state: next }])
    }
}

/// Poll progress for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollState {
    #[default]
    Idle,
    Polling,
}

/// Per-conversation in-flight guard for the poll schedule.
///
/// A tick that finds the guard already `Polling` must be skipped: polls for
/// the same conversation never overlap and are never queued.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollGuard {
    state: PollState,
}

impl PollGuard {
    pub fn state(&self) -> PollState {
        self.state
    }

    /// Claim the guard for a poll attempt. Returns `false` when a previous
    /// attempt is still in flight.
    pub fn try_begin(&mut self) -> bool {
        if self.state == PollState::Polling {
            return false;
        }
        self.state = PollState::Polling;
        true
    }

    /// Release the guard after the poll attempt resolves, success or failure.
    pub fn finish(&mut self) {
        self.state = PollState::Idle;
    }
}

/// Phase of one optimistic send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPhase {
    /// Message exists only at the call site.
    #[default]
    Composed,
    /// Provisional entry is visible in the store.
    Optimistic,
    /// Server acknowledged; provisional entry replaced.
    Confirmed,
    /// Server rejected; provisional entry rolled back.
    Failed,
}

/// Per-send lifecycle machine for optimistic sends.
///
/// Each send owns an independent machine; any number may be in flight.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendLifecycle {
    phase: SendPhase,
}

impl SendLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SendPhase {
        self.phase
    }

    /// `Composed → Optimistic`: the provisional entry was inserted.
    pub fn begin_optimistic(&mut self) -> Result<(), ChatError> {
        self.advance(SendPhase::Composed, SendPhase::Optimistic, "begin_optimistic")
    }

    /// `Optimistic → Confirmed`: server acknowledged the send.
    pub fn confirm(&mut self) -> Result<(), ChatError> {
        self.advance(SendPhase::Optimistic, SendPhase::Confirmed, "confirm")
    }

    /// `Optimistic → Failed`: send rejected, provisional entry rolled back.
    pub fn fail(&mut self) -> Result<(), ChatError> {
        self.advance(SendPhase::Optimistic, SendPhase::Failed, "fail")
    }

    fn advance(
        &mut self,
        expected: SendPhase,
        next: SendPhase,
        action: &str,
    ) -> Result<(), ChatError> {
        if self.phase != expected {
            return Err(ChatError::new(
                ChatErrorCategory::Internal,
                "invalid_send_transition",
                format!("cannot run '{action}' while send is in phase {:?}", self.phase),
            ));
        }
        self.phase = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_command() -> ChatCommand {
        ChatCommand::Init {
            base_url: "https://api.example.com".to_owned(),
            auth_token: "token".to_owned(),
            config: None,
        }
    }

    #[test]
    fn runs_happy_path_lifecycle_transitions() {
        let mut sm = ChatStateMachine::default();

        sm.apply(&init_command()).expect("init must work");
        assert_eq!(sm.state(), ChatLifecycleState::Authenticating);

        sm.on_auth_result(true).expect("auth should resolve");
        assert_eq!(sm.state(), ChatLifecycleState::Ready);

        sm.apply(&ChatCommand::OpenConversation {
            conversation_id: "c1".into(),
        })
        .expect("conversation command should pass in Ready");

        sm.apply(&ChatCommand::Shutdown).expect("shutdown should work");
        assert_eq!(sm.state(), ChatLifecycleState::Closed);
    }

    #[test]
    fn failed_auth_is_fatal() {
        let mut sm = ChatStateMachine::default();
        sm.apply(&init_command()).expect("init must work");

        sm.on_auth_result(false).expect("auth result should apply");
        assert_eq!(sm.state(), ChatLifecycleState::Fatal);

        let err = sm
            .apply(&ChatCommand::OpenConversation {
                conversation_id: "c1".into(),
            })
            .expect_err("conversation command should fail after fatal auth");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn rejects_conversation_commands_before_init() {
        let mut sm = ChatStateMachine::default();
        let err = sm
            .apply(&ChatCommand::LoadOlder {
                conversation_id: "c1".into(),
            })
            .expect_err("command should fail while cold");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn rejects_double_init() {
        let mut sm = ChatStateMachine::default();
        sm.apply(&init_command()).expect("first init must work");
        let err = sm
            .apply(&init_command())
            .expect_err("second init should fail");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn poll_guard_skips_overlapping_attempts() {
        let mut guard = PollGuard::default();

        assert!(guard.try_begin());
        assert_eq!(guard.state(), PollState::Polling);
        assert!(!guard.try_begin());

        guard.finish();
        assert_eq!(guard.state(), PollState::Idle);
        assert!(guard.try_begin());
    }

    #[test]
    fn send_lifecycle_confirm_path() {
        let mut send = SendLifecycle::new();
        send.begin_optimistic().expect("optimistic insert");
        send.confirm().expect("server ack");
        assert_eq!(send.phase(), SendPhase::Confirmed);
    }

    #[test]
    fn send_lifecycle_rollback_path() {
        let mut send = SendLifecycle::new();
        send.begin_optimistic().expect("optimistic insert");
        send.fail().expect("rollback");
        assert_eq!(send.phase(), SendPhase::Failed);
    }

    #[test]
    fn send_lifecycle_rejects_skipping_the_optimistic_phase() {
        let mut send = SendLifecycle::new();
        let err = send.confirm().expect_err("confirm before insert must fail");
        assert_eq!(err.code, "invalid_send_transition");

        send.begin_optimistic().expect("optimistic insert");
        send.confirm().expect("server ack");
        let err = send.fail().expect_err("fail after confirm must fail");
        assert_eq!(err.code, "invalid_send_transition");
    }
}
