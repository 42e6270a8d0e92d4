use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::agent_engine::state::TaskId;
use crate::errors::ExecutionError;
use crate::executor::device::ActionExecutor;
use crate::executor::input::{InputOp, Key, MouseButton};

/// Exclusive access to the one physical pointer/keyboard.
///
/// The critical section is a whole primitive-operation sequence: once a sequence
/// starts it runs to the end (or to its first failure) before another task's
/// sequence may begin, even if the caller stops waiting for it.
pub struct DeviceGate {
    executor: Arc<dyn ActionExecutor>,
    lock: Arc<Mutex<()>>,
}

impl DeviceGate {
    pub fn new(executor: Arc<dyn ActionExecutor>) -> Self {
        Self { executor, lock: Arc::new(Mutex::new(())) }
    }

    /// Run `ops` as one atomic sequence. A timeout is reported as an `ExecutionError`;
    /// a sequence already started keeps the device until it finishes.
    pub async fn run(&self, task_id: TaskId, ops: Vec<InputOp>, timeout: Duration) -> Result<(), ExecutionError> {
        if ops.is_empty() {
            return Ok(());
        }
        let lock = self.lock.clone();
        let executor = self.executor.clone();
        let count = ops.len();

        let guarded = async move {
            let guard = lock.lock_owned().await;
            tracing::debug!(task_id = %task_id, ops = count, "input device acquired");
            let handle = tokio::spawn(async move {
                let _guard = guard;
                run_sequence(executor.as_ref(), &ops).await
            });
            match handle.await {
                Ok(res) => res,
                Err(e) => Err(ExecutionError::device(format!("input sequence aborted: {e}"))),
            }
        };

        match tokio::time::timeout(timeout, guarded).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(task_id = %task_id, ms = timeout.as_millis() as u64, "input sequence timed out");
                Err(ExecutionError::timeout(format!(
                    "input sequence did not finish within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }
}

async fn run_sequence(executor: &dyn ActionExecutor, ops: &[InputOp]) -> Result<(), ExecutionError> {
    let mut held_buttons: Vec<MouseButton> = Vec::new();
    let mut held_keys: Vec<Key> = Vec::new();
    for op in ops {
        if let Err(e) = executor.execute(op).await {
            release_held(executor, &held_buttons, &held_keys).await;
            return Err(e);
        }
        match op {
            InputOp::ButtonDown { button } => held_buttons.push(*button),
            InputOp::ButtonUp { button } => held_buttons.retain(|b| b != button),
            InputOp::KeyDown { key } => held_keys.push(*key),
            InputOp::KeyUp { key } => held_keys.retain(|k| k != key),
            _ => {}
        }
    }
    Ok(())
}

/// Best effort: never leave a button or modifier pressed after a failed sequence.
async fn release_held(executor: &dyn ActionExecutor, buttons: &[MouseButton], keys: &[Key]) {
    for button in buttons.iter().rev() {
        if let Err(e) = executor.execute(&InputOp::ButtonUp { button: *button }).await {
            tracing::warn!(?button, error = %e, "failed to release mouse button");
        }
    }
    for key in keys.iter().rev() {
        if let Err(e) = executor.execute(&InputOp::KeyUp { key: *key }).await {
            tracing::warn!(?key, error = %e, "failed to release key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        ops: StdMutex<Vec<InputOp>>,
        fail_on: Option<InputOp>,
        delay: Duration,
    }

    #[async_trait]
    impl ActionExecutor for Recorder {
        async fn execute(&self, op: &InputOp) -> Result<(), ExecutionError> {
            tokio::time::sleep(self.delay).await;
            self.ops.lock().unwrap().push(op.clone());
            if self.fail_on.as_ref() == Some(op) {
                return Err(ExecutionError::device("device unplugged"));
            }
            Ok(())
        }
    }

    fn drag(x: i32) -> Vec<InputOp> {
        vec![
            InputOp::MoveTo { x, y: 0 },
            InputOp::ButtonDown { button: MouseButton::Left },
            InputOp::MoveTo { x, y: 100 },
            InputOp::ButtonUp { button: MouseButton::Left },
        ]
    }

    #[tokio::test]
    async fn concurrent_sequences_do_not_interleave() {
        let rec = Arc::new(Recorder { delay: Duration::from_millis(2), ..Default::default() });
        let gate = Arc::new(DeviceGate::new(rec.clone()));
        let mut handles = Vec::new();
        for x in [10, 20, 30] {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.run(TaskId::new(), drag(x), Duration::from_secs(5)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let ops = rec.ops.lock().unwrap();
        assert_eq!(ops.len(), 12);
        for chunk in ops.chunks(4) {
            let InputOp::MoveTo { x, .. } = chunk[0] else { panic!("sequence must start with a move") };
            assert_eq!(chunk.to_vec(), drag(x));
        }
    }

    #[tokio::test]
    async fn failure_releases_held_button() {
        let rec = Arc::new(Recorder { fail_on: Some(InputOp::MoveTo { x: 5, y: 100 }), ..Default::default() });
        let gate = DeviceGate::new(rec.clone());
        let err = gate.run(TaskId::new(), drag(5), Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind, crate::errors::ExecutionErrorKind::Device);
        let ops = rec.ops.lock().unwrap();
        assert_eq!(ops.last(), Some(&InputOp::ButtonUp { button: MouseButton::Left }));
    }

    #[tokio::test]
    async fn timed_out_sequence_still_completes() {
        let rec = Arc::new(Recorder { delay: Duration::from_millis(20), ..Default::default() });
        let gate = DeviceGate::new(rec.clone());
        let err = gate.run(TaskId::new(), drag(1), Duration::from_millis(5)).await.unwrap_err();
        assert_eq!(err.kind, crate::errors::ExecutionErrorKind::Timeout);
        // the next sequence waits for the first one to finish
        gate.run(TaskId::new(), drag(2), Duration::from_secs(5)).await.unwrap();
        let ops = rec.ops.lock().unwrap();
        assert_eq!(ops[..4].to_vec(), drag(1));
        assert_eq!(ops[4..].to_vec(), drag(2));
    }
}
