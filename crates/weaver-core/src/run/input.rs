//! User input gate
//!
//! Interactive tools park here until the user answers. The first open
//! question moves the run to `waiting_input`; answering the last one moves
//! it back to `running`. Time spent waiting is tracked so task timeouts can
//! discount it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};

use super::events::RunEvent;
use super::RunStatus;
use crate::agent::AgentCancellation;
use crate::error::{AgentError, RunError};
use crate::events::EventBus;

/// A question waiting for the user, as shown to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingQuestion {
    pub question_id: String,
    pub question: String,
    pub task_id: Option<String>,
}

struct Waiter {
    info: PendingQuestion,
    answer_tx: oneshot::Sender<String>,
}

#[derive(Default)]
struct GateState {
    pending: VecDeque<Waiter>,
    waiting_since: Option<Instant>,
    suspended_total: Duration,
    closed: bool,
}

impl GateState {
    /// Stop the waiting clock once nothing is pending; returns the wait length
    fn settle(&mut self) -> Option<Duration> {
        if !self.pending.is_empty() {
            return None;
        }
        let waited = self.waiting_since.take()?.elapsed();
        self.suspended_total += waited;
        Some(waited)
    }
}

/// Channel between a run's agents and the user
pub struct InputGate {
    run_id: String,
    session_id: String,
    bus: EventBus,
    status: Arc<watch::Sender<RunStatus>>,
    state: Mutex<GateState>,
}

impl InputGate {
    pub fn new(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        bus: EventBus,
        status: Arc<watch::Sender<RunStatus>>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            bus,
            status,
            state: Mutex::new(GateState::default()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Ask the user a question and wait for the answer
    pub async fn ask(
        &self,
        question: &str,
        options: Vec<String>,
        task_id: Option<&str>,
        agent_id: &str,
        cancellation: &AgentCancellation,
    ) -> Result<String, AgentError> {
        let info = PendingQuestion {
            question_id: uuid::Uuid::new_v4().to_string(),
            question: question.to_string(),
            task_id: task_id.map(str::to_string),
        };
        let (answer_tx, answer_rx) = oneshot::channel();

        let first = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(AgentError::Cancelled);
            }
            state.pending.push_back(Waiter {
                info: info.clone(),
                answer_tx,
            });
            if state.waiting_since.is_none() {
                state.waiting_since = Some(Instant::now());
                true
            } else {
                false
            }
        };

        if first {
            self.set_status(RunStatus::Running, RunStatus::WaitingInput);
            self.bus.emit(
                &self.session_id,
                &RunEvent::RunWaitingInput {
                    run_id: self.run_id.clone(),
                    question_id: info.question_id.clone(),
                    question: info.question.clone(),
                    task_id: info.task_id.clone(),
                },
            );
            tracing::info!(run_id = %self.run_id, question_id = %info.question_id, "Run waiting for input");
        }
        self.bus.emit(
            &self.session_id,
            &RunEvent::InterviewQuestion {
                run_id: self.run_id.clone(),
                question_id: info.question_id.clone(),
                question: info.question.clone(),
                options,
                agent_id: agent_id.to_string(),
                task_id: info.task_id.clone(),
            },
        );

        tokio::select! {
            answer = answer_rx => answer.map_err(|_| AgentError::Cancelled),
            _ = cancellation.cancelled() => {
                self.withdraw(&info.question_id);
                Err(AgentError::Cancelled)
            }
        }
    }

    /// Answer an open question: the given one, or the oldest when `None`
    pub fn provide_input(
        &self,
        answer: &str,
        question_id: Option<&str>,
    ) -> Result<String, RunError> {
        let (waiter, waited) = {
            let mut state = self.state.lock();
            let index = match question_id {
                Some(id) => state.pending.iter().position(|w| w.info.question_id == id),
                None => (!state.pending.is_empty()).then_some(0),
            };
            let waiter = index
                .and_then(|i| state.pending.remove(i))
                .ok_or_else(|| RunError::NoPendingInput(self.run_id.clone()))?;
            (waiter, state.settle())
        };

        let question_id = waiter.info.question_id.clone();
        self.bus.emit(
            &self.session_id,
            &RunEvent::InterviewAnswer {
                run_id: self.run_id.clone(),
                question_id: question_id.clone(),
                answer: answer.to_string(),
            },
        );
        if waiter.answer_tx.send(answer.to_string()).is_err() {
            tracing::debug!(run_id = %self.run_id, question_id = %question_id, "Asker went away before the answer");
        }

        if let Some(waited) = waited {
            self.resume(waited);
        }
        Ok(question_id)
    }

    /// Open questions, oldest first
    pub fn pending(&self) -> Vec<PendingQuestion> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|w| w.info.clone())
            .collect()
    }

    /// Total time the run has spent waiting for the user so far
    pub fn suspended(&self) -> Duration {
        let state = self.state.lock();
        state.suspended_total
            + state
                .waiting_since
                .map(|since| since.elapsed())
                .unwrap_or_default()
    }

    /// Refuse new questions and fail the open ones
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.clear();
        state.settle();
    }

    fn withdraw(&self, question_id: &str) {
        let waited = {
            let mut state = self.state.lock();
            state.pending.retain(|w| w.info.question_id != question_id);
            state.settle()
        };
        if let Some(waited) = waited {
            self.resume(waited);
        }
    }

    fn resume(&self, waited: Duration) {
        if self.set_status(RunStatus::WaitingInput, RunStatus::Running) {
            self.bus.emit(
                &self.session_id,
                &RunEvent::RunResumed {
                    run_id: self.run_id.clone(),
                    waited_ms: waited.as_millis() as u64,
                },
            );
            tracing::info!(run_id = %self.run_id, waited_ms = waited.as_millis() as u64, "Run resumed");
        }
    }

    /// Move the run from `from` to `to`; any other current status is left alone
    fn set_status(&self, from: RunStatus, to: RunStatus) -> bool {
        self.status.send_if_modified(|status| {
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventEnvelope;

    fn gate(bus: &EventBus) -> (Arc<InputGate>, watch::Receiver<RunStatus>) {
        let (tx, rx) = watch::channel(RunStatus::Running);
        let gate = InputGate::new("r1", "s1", bus.clone(), Arc::new(tx));
        (Arc::new(gate), rx)
    }

    async fn next(sub: &mut crate::events::EventSubscription) -> EventEnvelope {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_for_pending(gate: &InputGate, count: usize) {
        for _ in 0..100 {
            if gate.pending().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} pending questions");
    }

    #[tokio::test]
    async fn question_suspends_and_answer_resumes() {
        let bus = EventBus::new(64);
        let mut sub = bus.subscribe();
        let (gate, status) = gate(&bus);

        let asker = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.ask("Which tone?", vec![], Some("t1"), "a1", &AgentCancellation::new())
                    .await
            })
        };
        wait_for_pending(&gate, 1).await;
        assert_eq!(*status.borrow(), RunStatus::WaitingInput);

        gate.provide_input("formal", None).unwrap();
        assert_eq!(asker.await.unwrap().unwrap(), "formal");
        assert_eq!(*status.borrow(), RunStatus::Running);

        let types: Vec<String> = [
            next(&mut sub).await,
            next(&mut sub).await,
            next(&mut sub).await,
            next(&mut sub).await,
        ]
        .into_iter()
        .map(|e| e.event_type)
        .collect();
        assert_eq!(
            types,
            vec![
                "run_waiting_input",
                "interview_question",
                "interview_answer",
                "run_resumed"
            ]
        );
    }

    #[tokio::test]
    async fn run_stays_waiting_until_every_question_is_answered() {
        let bus = EventBus::new(64);
        let (gate, status) = gate(&bus);

        let mut askers = Vec::new();
        for q in ["first?", "second?"] {
            let asker = gate.clone();
            askers.push(tokio::spawn(async move {
                asker.ask(q, vec![], None, "a1", &AgentCancellation::new()).await
            }));
            wait_for_pending(&gate, askers.len()).await;
        }

        let second = gate.pending()[1].question_id.clone();
        gate.provide_input("two", Some(&second)).unwrap();
        assert_eq!(*status.borrow(), RunStatus::WaitingInput);

        gate.provide_input("one", None).unwrap();
        assert_eq!(*status.borrow(), RunStatus::Running);

        let answers: Vec<String> = futures::future::join_all(askers)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        assert_eq!(answers, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn answer_without_question_is_rejected() {
        let bus = EventBus::new(8);
        let (gate, _status) = gate(&bus);
        let err = gate.provide_input("hello", None).unwrap_err();
        assert!(matches!(err, RunError::NoPendingInput(id) if id == "r1"));
    }

    #[tokio::test]
    async fn cancelled_asker_withdraws_question() {
        let bus = EventBus::new(64);
        let (gate, status) = gate(&bus);
        let cancel = AgentCancellation::new();

        let asker = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.ask("still there?", vec![], None, "a1", &cancel).await })
        };
        wait_for_pending(&gate, 1).await;
        cancel.cancel();

        assert!(matches!(asker.await.unwrap(), Err(AgentError::Cancelled)));
        assert!(gate.pending().is_empty());
        assert_eq!(*status.borrow(), RunStatus::Running);
    }

    #[tokio::test]
    async fn waiting_time_accumulates() {
        let bus = EventBus::new(64);
        let (gate, _status) = gate(&bus);

        let asker = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.ask("q", vec![], None, "a1", &AgentCancellation::new()).await
            })
        };
        wait_for_pending(&gate, 1).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        gate.provide_input("a", None).unwrap();
        asker.await.unwrap().unwrap();

        let suspended = gate.suspended();
        assert!(suspended >= Duration::from_millis(40));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.suspended(), suspended);
    }

    #[tokio::test]
    async fn closed_gate_refuses_questions() {
        let bus = EventBus::new(8);
        let (gate, _status) = gate(&bus);
        gate.close();
        let result = gate
            .ask("anyone?", vec![], None, "a1", &AgentCancellation::new())
            .await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }
}
