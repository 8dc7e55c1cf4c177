//! Request dispatcher: bounded concurrency, bounded queueing, fail-fast
//! overload, and external cancellation.
//!
//! At most `max_concurrent_executions` contexts run at once; up to
//! `queue_capacity` more wait in FIFO order. Anything beyond that is
//! rejected with `Overload` without consuming resources. Interpreter work
//! is synchronous, so each admitted request runs on a blocking thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::error::ErrorKind;
use crate::executor::{ExecutionControl, ExecutionCore, ExecutionRequest, ExecutionResponse};
use crate::gas::GasMeter;

/// Grace past the request's own wall deadline before the dispatcher
/// watchdog declares the context wedged.
const WATCHDOG_GRACE: Duration = Duration::from_secs(2);

pub struct Dispatcher {
    core: Arc<ExecutionCore>,
    /// Permits for running contexts.
    running: Arc<Semaphore>,
    /// Permits for admitted (running + queued) requests.
    admitted: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<String, Arc<ExecutionControl>>>>,
}

impl Dispatcher {
    pub(crate) fn new(core: Arc<ExecutionCore>, config: &DispatcherConfig) -> Self {
        Self {
            core,
            running: Arc::new(Semaphore::new(config.max_concurrent_executions)),
            admitted: Arc::new(Semaphore::new(
                config.max_concurrent_executions + config.queue_capacity,
            )),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Execute one request to completion.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResponse {
        let admitted = match self.admitted.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(function = %request.function_id, "rejecting request: at capacity");
                return self.refusal(ErrorKind::Overload, "dispatcher at capacity, retry later");
            }
        };

        let running = match self.running.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return self.refusal(ErrorKind::IoError, "dispatcher shutting down");
            }
        };

        let execution_id = request
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let time_rate = if self.core.gas_config.enable_time_based_gas {
            self.core.gas_config.gas_per_ms
        } else {
            0
        };
        let meter = Arc::new(GasMeter::new(request.gas_limit, time_rate));
        let control = Arc::new(ExecutionControl::new(meter));
        self.active
            .lock()
            .unwrap()
            .insert(execution_id.clone(), control.clone());

        let max_wall_ms = request.max_wall_ms.min(crate::executor::MAX_WALL_MS);
        let core = self.core.clone();
        let run_control = control.clone();
        let mut handle =
            tokio::task::spawn_blocking(move || core.run(&request, run_control));

        // Belt over the sandbox's own deadline: if the context is wedged
        // past its wall budget plus grace, cancel it and wait for cleanup.
        let deadline = Duration::from_millis(max_wall_ms) + WATCHDOG_GRACE;

        let response = match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(response)) => response,
            Ok(Err(join_error)) => {
                warn!(error = %join_error, "execution task failed");
                self.refusal(ErrorKind::IoError, "execution task failed")
            }
            Err(_) => {
                warn!(execution_id = %execution_id, "context wedged; cancelling");
                control.cancel();
                match handle.await {
                    Ok(mut response) => {
                        response.success = false;
                        response.result = None;
                        response.error_kind = Some(ErrorKind::TimeoutError);
                        response.error_message =
                            Some("dispatcher watchdog deadline exceeded".to_string());
                        response
                    }
                    Err(join_error) => {
                        warn!(error = %join_error, "wedged execution task failed");
                        self.refusal(ErrorKind::TimeoutError, "dispatcher watchdog deadline exceeded")
                    }
                }
            }
        };

        self.active.lock().unwrap().remove(&execution_id);
        drop(running);
        drop(admitted);
        response
    }

    /// Cancel an in-flight execution by id. Idempotent; returns whether
    /// the id was active.
    pub fn cancel(&self, execution_id: &str) -> bool {
        match self.active.lock().unwrap().get(execution_id) {
            Some(control) => {
                control.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of currently admitted executions.
    pub fn active_executions(&self) -> Vec<String> {
        self.active.lock().unwrap().keys().cloned().collect()
    }

    fn refusal(&self, kind: ErrorKind, message: &str) -> ExecutionResponse {
        ExecutionResponse {
            success: false,
            result: None,
            gas_used: 0,
            wall_ms: 0,
            attestation_valid: false,
            enclave_id: self.core.enclave_id.clone(),
            error_kind: Some(kind),
            error_message: Some(message.to_string()),
            profile: None,
        }
    }
}
