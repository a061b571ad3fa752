//! Submission scheduler
//!
//! A poll loop feeds waiting submissions into a bounded task queue. One
//! dispatch loop per [`Evaluator`] pulls from that queue, compiles, runs the
//! tests in order and pushes store writes onto a bounded update queue, which
//! a single update loop drains.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

pub use crate::grader::update::Update;
pub use crate::grader::verdict::{INTERNAL_ERROR_SCORE, internal_error, judge, total_score};
use crate::config::GraderConfig;
use crate::grader::update::update_loop;
use crate::protocol::{CompileRequest, Evaluator, ExecuteStream, TestRequest, TestResponse};
use crate::store::{SubmissionStore, TestStorage};
use crate::submission::{Submission, SubmissionStatus, TestResult, TestResultUpdate};

mod update;
mod verdict;

pub struct Grader {
    store: Arc<dyn SubmissionStore>,
    storage: Arc<dyn TestStorage>,
    evaluators: Vec<Arc<dyn Evaluator>>,
    config: GraderConfig,
}

impl Grader {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        storage: Arc<dyn TestStorage>,
        evaluators: Vec<Arc<dyn Evaluator>>,
        config: GraderConfig,
    ) -> Self {
        Self {
            store,
            storage,
            evaluators,
            config,
        }
    }

    /// Grade until `cancel` fires.
    ///
    /// On cancellation polling stops, in-flight submissions finish, queued
    /// updates are written, then every evaluator shuts down.
    pub async fn run(self, cancel: CancellationToken) {
        let (task_tx, task_rx) = mpsc::channel(self.config.task_queue_size);
        let (update_tx, update_rx) = mpsc::channel(self.config.update_queue_size);
        let task_rx = Arc::new(Mutex::new(task_rx));

        // Ids handed to the queue whose final status is not yet written
        let in_flight = Arc::new(parking_lot::Mutex::new(HashSet::new()));

        let store = Arc::clone(&self.store);
        let released = Arc::clone(&in_flight);
        let updates = tokio::spawn(
            async move { update_loop(update_rx, store.as_ref(), &released).await }
                .instrument(info_span!("updates")),
        );

        let mut dispatchers = JoinSet::new();
        for (index, evaluator) in self.evaluators.iter().enumerate() {
            let dispatcher = Dispatcher {
                evaluator: Arc::clone(evaluator),
                storage: Arc::clone(&self.storage),
                tasks: Arc::clone(&task_rx),
                updates: update_tx.clone(),
            };
            dispatchers.spawn(
                dispatcher
                    .run(cancel.clone())
                    .instrument(info_span!("dispatcher", index)),
            );
        }
        drop(update_tx);
        info!(dispatchers = self.evaluators.len(), "grader started");

        self.poll_loop(task_tx, &in_flight, &cancel).await;

        while let Some(joined) = dispatchers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "dispatcher panicked");
            }
        }
        if let Err(e) = updates.await {
            error!(error = %e, "update loop panicked");
        }
        for evaluator in &self.evaluators {
            evaluator.shutdown().await;
        }
        info!("grader stopped");
    }

    async fn poll_loop(
        &self,
        tasks: mpsc::Sender<Submission>,
        in_flight: &parking_lot::Mutex<HashSet<u64>>,
        cancel: &CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let waiting = match self.store.fetch_waiting_submissions().await {
                Ok(waiting) => waiting,
                Err(e) => {
                    warn!(error = format!("{e:#}"), "failed to fetch waiting submissions");
                    continue;
                }
            };
            for submission in waiting {
                if !in_flight.lock().insert(submission.id) {
                    continue;
                }
                debug!(submission = submission.id, "queueing submission");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tasks.send(submission) => {
                        if sent.is_err() {
                            warn!("task queue closed");
                            return;
                        }
                    }
                }
            }
        }
        debug!("poll loop stopped");
    }
}

struct Dispatcher {
    evaluator: Arc<dyn Evaluator>,
    storage: Arc<dyn TestStorage>,
    tasks: Arc<Mutex<mpsc::Receiver<Submission>>>,
    updates: mpsc::Sender<Update>,
}

impl Dispatcher {
    async fn run(self, cancel: CancellationToken) {
        loop {
            let next = {
                let mut tasks = self.tasks.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    submission = tasks.recv() => submission,
                }
            };
            let Some(submission) = next else {
                break;
            };
            self.grade(submission).await;
        }
        debug!("dispatcher stopped");
    }

    #[instrument(skip_all, fields(submission = submission.id))]
    async fn grade(&self, submission: Submission) {
        let mut status = submission.status;
        self.advance(submission.id, &mut status, SubmissionStatus::Working, 0)
            .await;

        if !self.compile(&submission).await {
            self.advance(submission.id, &mut status, SubmissionStatus::Done, 0)
                .await;
            return;
        }

        let mut stream = match self.evaluator.execute(submission.id).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                warn!(error = %e, "could not open execute stream");
                Err(e.to_string())
            }
        };

        let mut results = Vec::with_capacity(submission.tests.len());
        for result in submission.tests_in_order() {
            let update = match stream {
                Ok(ref mut stream) => self.run_test(stream, &submission, result).await,
                Err(ref reason) => internal(result, reason),
            };
            debug!(result = result.id, score = update.score, message = %update.message, "test graded");
            self.send(Update::TestResult {
                result_id: result.id,
                update: update.clone(),
            })
            .await;
            results.push(update);
        }

        if let Ok(stream) = stream
            && let Err(e) = stream.finish().await
        {
            warn!(error = %e, "execute stream did not finish cleanly");
        }

        let score = total_score(&results);
        info!(score, tests = results.len(), "submission graded");
        self.advance(submission.id, &mut status, SubmissionStatus::Done, score)
            .await;
    }

    /// Move the submission to `next` and queue the status write.
    ///
    /// The lifecycle is tracked here rather than read back from the store, so
    /// a lost `Working` write cannot hold a submission back from `Done`.
    async fn advance(
        &self,
        submission_id: u64,
        status: &mut SubmissionStatus,
        next: SubmissionStatus,
        score: i32,
    ) {
        match status.transition(next) {
            Ok(next) => {
                *status = next;
                self.send(Update::Status {
                    submission_id,
                    status: next,
                    score,
                })
                .await;
            }
            Err(e) => error!(error = %e, "status change refused"),
        }
    }

    /// Compile and record the outcome; `false` when grading stops here
    async fn compile(&self, submission: &Submission) -> bool {
        let request = CompileRequest {
            submission_id: submission.id,
            language: submission.language.clone(),
            code: submission.code.clone(),
        };
        let (success, output) = match self.evaluator.compile(request).await {
            Ok(response) if response.success => (true, response.output),
            Ok(response) if !response.other.is_empty() => {
                warn!(reason = %response.other, "compilation not attempted");
                (false, internal_error(&response.other))
            }
            Ok(response) => (false, response.output),
            Err(e) => {
                warn!(error = %e, "compile call failed");
                (false, internal_error(&e.to_string()))
            }
        };
        debug!(success, "compiled");

        self.send(Update::Compile {
            submission_id: submission.id,
            success,
            output,
        })
        .await;
        success
    }

    async fn run_test(
        &self,
        stream: &mut Box<dyn ExecuteStream>,
        submission: &Submission,
        result: &TestResult,
    ) -> TestResultUpdate {
        let test = &result.test;
        let payloads = async {
            let input = self.storage.test_input(test.problem_id, test.id).await?;
            let expected = self.storage.test_output(test.problem_id, test.id).await?;
            anyhow::Ok((input, expected))
        };
        let (input, expected) = match payloads.await {
            Ok(payloads) => payloads,
            Err(e) => {
                warn!(test = test.id, error = format!("{e:#}"), "test data unavailable");
                return internal(result, &format!("{e:#}"));
            }
        };

        let request = TestRequest {
            test_id: result.id,
            submission_id: submission.id,
            language: submission.language.clone(),
            input: String::from_utf8_lossy(&input).into_owned(),
            output_stem: submission.problem.effective_stem().to_owned(),
            limits: submission.problem.limits,
        };
        match stream.run(request).await {
            Ok(response) => judge(&response, &expected, test.weight),
            Err(e) => {
                warn!(test = test.id, error = %e, "test run failed");
                internal(result, &e.to_string())
            }
        }
    }

    async fn send(&self, update: Update) {
        if self.updates.send(update).await.is_err() {
            error!("update queue closed, dropping update");
        }
    }
}

fn internal(result: &TestResult, reason: &str) -> TestResultUpdate {
    judge(&TestResponse::internal(result.id, reason), &[], result.test.weight)
}
