//! Per-instance dispatch engine: admission, bounded queue and worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kestrel_core::{AppError, AppResult, InstanceName};
use kestrel_domain::{Request, RequestType};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::request_handler::{ConcurrencySlot, HandlerRegistry, ScratchValues};


/// Tunables of one request controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Maximum number of concurrently executing requests.
    pub concurrency: usize,
    /// Capacity of the queue between intake and the worker pool.
    pub queue_capacity: usize,
    /// Time intake stays open after shutdown was requested.
    pub drain_grace: Duration,
    /// Upper bound on waiting for running workers during shutdown.
    pub worker_drain_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            concurrency: 100,
            queue_capacity: 2000,
            drain_grace: Duration::from_secs(2),
            worker_drain_timeout: Duration::from_secs(15),
        }
    }
}

/// How an accepted request was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    /// Persisted and handed to the worker pool.
    Queued,
    /// Persisting failed; executed inline instead.
    Synchronous,
}

/// Result of [`RequestController::accept_request`].
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedRequest {
    /// Execution path taken.
    pub path: ExecutionPath,
    /// Value returned to the caller.
    pub response: Value,
}

/// Accepts requests for one instance and runs them with bounded concurrency.
pub struct RequestController {
    instance_name: InstanceName,
    handlers: HandlerRegistry,
    settings: ControllerSettings,
    permits: Arc<Semaphore>,
    sender: Mutex<Option<mpsc::Sender<Request>>>,
    receiver: Mutex<Option<mpsc::Receiver<Request>>>,
    stopping: AtomicBool,
    dispatch_finished: CancellationToken,
}

impl RequestController {
    /// Creates a controller; the dispatch loop starts with [`Self::start_up`].
    pub fn new(
        instance_name: InstanceName,
        handlers: HandlerRegistry,
        settings: ControllerSettings,
    ) -> AppResult<Self> {
        if settings.concurrency == 0 || settings.concurrency > Semaphore::MAX_PERMITS {
            return Err(AppError::Validation(format!(
                "controller concurrency must be between 1 and {}",
                Semaphore::MAX_PERMITS
            )));
        }

        if settings.queue_capacity == 0 {
            return Err(AppError::Validation(
                "controller queue capacity must be greater than zero".to_owned(),
            ));
        }

        let (sender, receiver) = mpsc::channel(settings.queue_capacity);
        Ok(Self {
            instance_name,
            handlers,
            permits: Arc::new(Semaphore::new(settings.concurrency)),
            settings,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            stopping: AtomicBool::new(false),
            dispatch_finished: CancellationToken::new(),
        })
    }

    /// Returns the owning instance name.
    #[must_use]
    pub fn instance_name(&self) -> &InstanceName {
        &self.instance_name
    }

    /// Returns the registered handlers.
    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Returns whether shutdown has closed intake.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Returns the number of requests currently holding a worker slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.settings
            .concurrency
            .saturating_sub(self.permits.available_permits())
    }

    /// Validates, persists and queues one request.
    ///
    /// When the request cannot be persisted it is executed inline and the
    /// synchronous result is returned instead.
    pub async fn accept_request(
        &self,
        mut payload: Value,
        request_type: &str,
    ) -> AppResult<AcceptedRequest> {
        if self.is_stopping() {
            return Err(AppError::Conflict(format!(
                "instance '{}' is shutting down and accepts no new requests",
                self.instance_name
            )));
        }

        let request_type = RequestType::parse(request_type)?;
        let handler = self.handlers.resolve(&request_type)?;
        let mut scratch = ScratchValues::new();

        handler.set_instance_name(&mut payload, &self.instance_name);
        handler.pre_exec(&mut payload, &request_type, &mut scratch)?;

        let request = match handler.make_request(&payload, &request_type, &scratch).await {
            Ok(request) => request,
            Err(error) => {
                warn!(
                    instance = %self.instance_name,
                    request_type = %request_type,
                    error = %error,
                    "request could not be persisted; executing synchronously"
                );
                let response = handler.sync_exec(payload, &request_type, &scratch).await?;
                return Ok(AcceptedRequest {
                    path: ExecutionPath::Synchronous,
                    response,
                });
            }
        };

        self.enqueue(request.clone()).await;

        if let Err(error) = handler
            .post_async_exec(&request, &request_type, &scratch)
            .await
        {
            warn!(
                instance = %self.instance_name,
                request = %request.name(),
                error = %error,
                "post-enqueue hook failed"
            );
        }

        Ok(AcceptedRequest {
            path: ExecutionPath::Queued,
            response: handler.make_async_response(payload, &request_type, &scratch),
        })
    }

    /// Hands a persisted request to the worker queue without waiting for room.
    ///
    /// Once the queue is closed the request is left in the registry, where
    /// takeover recovers it after this instance's lease lapses.
    pub async fn enqueue(&self, request: Request) {
        let sender = self.sender.lock().await.clone();
        let Some(sender) = sender else {
            warn!(
                instance = %self.instance_name,
                request = %request.name(),
                "request queue closed; request left for takeover"
            );
            return;
        };

        tokio::spawn(async move {
            if let Err(error) = sender.send(request).await {
                warn!(
                    request = %error.0.name(),
                    "request queue closed before hand-off"
                );
            }
        });
    }

    /// Runs the dispatch loop until the queue is closed and drained.
    pub async fn start_up(&self) -> AppResult<()> {
        let Some(mut receiver) = self.receiver.lock().await.take() else {
            return Err(AppError::Conflict(format!(
                "dispatch loop of instance '{}' already started",
                self.instance_name
            )));
        };

        info!(
            instance = %self.instance_name,
            concurrency = self.settings.concurrency,
            queue_capacity = self.settings.queue_capacity,
            "dispatch loop started"
        );

        while let Some(request) = receiver.recv().await {
            if self.is_stopping() {
                debug!(
                    request = %request.name(),
                    "dropping queued request during shutdown"
                );
                continue;
            }

            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };

            let handler = match self.handlers.resolve(request.request_type()) {
                Ok(handler) => handler,
                Err(error) => {
                    warn!(request = %request.name(), error = %error, "queued request has no handler");
                    continue;
                }
            };

            tokio::spawn(async move {
                let request_name = request.name().to_owned();
                if let Err(error) = handler.async_exec(request, ConcurrencySlot::new(permit)).await
                {
                    warn!(request = %request_name, error = %error, "request execution failed");
                }
            });
        }

        self.dispatch_finished.cancel();
        info!(instance = %self.instance_name, "dispatch loop stopped");
        Ok(())
    }

    /// Closes intake, drains the queue and waits for running workers.
    pub async fn shutdown(&self) {
        tokio::time::sleep(self.settings.drain_grace).await;
        self.stopping.store(true, Ordering::SeqCst);
        self.sender.lock().await.take();

        if self.receiver.lock().await.take().is_some() {
            self.dispatch_finished.cancel();
        }
        self.dispatch_finished.cancelled().await;

        let all_permits = u32::try_from(self.settings.concurrency).unwrap_or(u32::MAX);
        match tokio::time::timeout(
            self.settings.worker_drain_timeout,
            self.permits.acquire_many(all_permits),
        )
        .await
        {
            Ok(_) => info!(instance = %self.instance_name, "all workers drained"),
            Err(_) => warn!(
                instance = %self.instance_name,
                in_flight = self.in_flight(),
                "workers still running after drain timeout"
            ),
        }
    }
}
