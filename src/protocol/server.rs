/// Protocol Server
///
/// Reads request lines on the calling thread and hands everything except
/// CANCEL to a single worker thread that owns the session, so statements run
/// strictly one after another while CANCEL is answered immediately, even when
/// the worker is blocked inside the driver. Responses from both threads go
/// through one locked writer, one line per response, flushed each time.

use super::{parse_request, Rejected, Request, Response, ResponseKind, StatusPayload};
use crate::classifier::Classifier;
use crate::config::Config;
use crate::core::db::{CancelRegistry, QueryFailure, QueryRequest, QueryResult, CONNECTION_ERROR_TYPE};
use crate::core::{BridgeError, Result};
use crate::driver::Driver;
use crate::session::Session;
use std::io::{BufRead, Write};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

/// Shared line writer for responses
#[derive(Clone)]
pub struct ResponseWriter {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ResponseWriter {
    pub fn new<W: Write + Send + 'static>(out: W) -> Self {
        ResponseWriter {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    /// Writes `response` as one JSON line and flushes.
    pub fn send(&self, response: &Response) -> Result<()> {
        let line = serde_json::to_string(response)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| BridgeError::App("Failed to acquire output lock".to_string()))?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

/// Work queued for the worker thread, in arrival order.
enum Job {
    Handle(Request),
    Reply(Response),
    Close,
    EndOfInput,
}

/// The request server
pub struct Server {
    driver: Arc<dyn Driver>,
    config: Arc<Config>,
    classifier: Arc<Classifier>,
    registry: Arc<CancelRegistry>,
}

impl Server {
    pub fn new(driver: Arc<dyn Driver>, config: Config) -> Self {
        let classifier = Classifier::for_driver(driver.name(), &config.diagnostics);
        Server {
            driver,
            config: Arc::new(config),
            classifier: Arc::new(classifier),
            registry: Arc::new(CancelRegistry::new()),
        }
    }

    /// Serves requests from `input` until CLOSE or end of input.
    ///
    /// # Errors
    ///
    /// Fails only when input cannot be read or output cannot be written.
    pub fn serve<R, W>(&self, input: R, output: W) -> Result<()>
    where
        R: BufRead,
        W: Write + Send + 'static,
    {
        let writer = ResponseWriter::new(output);
        writer.send(&Response::ready())?;
        info!(driver = self.driver.name(), "ready");

        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let worker = Worker {
            driver: Arc::clone(&self.driver),
            config: Arc::clone(&self.config),
            classifier: Arc::clone(&self.classifier),
            registry: Arc::clone(&self.registry),
            writer: writer.clone(),
            session: None,
        };
        let worker = thread::Builder::new()
            .name("sqlbridge-worker".to_string())
            .spawn(move || worker.run(job_rx))?;

        let read_result = self.read_loop(input, &writer, &job_tx);
        // The worker drains what is queued, then exits on the closing job.
        let final_job = match read_result {
            Ok(true) => Job::Close,
            _ => Job::EndOfInput,
        };
        let _ = job_tx.send(final_job);
        drop(job_tx);

        let worker_result = worker
            .join()
            .map_err(|_| BridgeError::App("worker thread panicked".to_string()))?;
        read_result?;
        worker_result
    }

    /// Returns `Ok(true)` when CLOSE was received, `Ok(false)` at end of input.
    fn read_loop<R: BufRead>(
        &self,
        mut input: R,
        writer: &ResponseWriter,
        jobs: &mpsc::Sender<Job>,
    ) -> Result<bool> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                break;
            }

            let parsed = match std::str::from_utf8(&buf) {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => parse_request(line.trim_end_matches(['\r', '\n'])),
                Err(e) => Err(Rejected::new(format!("Invalid JSON: {}", e), None)),
            };
            let job = match parsed {
                Ok(Request::Cancel { result_set_id }) => {
                    debug!(request = "CANCEL", "handling request");
                    let outcome = self.registry.cancel(result_set_id.as_deref());
                    writer.send(&Response::cancel(&outcome)?)?;
                    continue;
                }
                Ok(Request::Close {}) => return Ok(true),
                Ok(request) => Job::Handle(request),
                Err(rejected) => {
                    warn!(error = %rejected.error, "rejected request");
                    Job::Reply(Response::rejected(&rejected))
                }
            };
            if jobs.send(job).is_err() {
                return Err(BridgeError::App("worker thread stopped".to_string()));
            }
        }
        debug!("end of input");
        Ok(false)
    }
}

/// Owns the session; runs on its own thread.
struct Worker {
    driver: Arc<dyn Driver>,
    config: Arc<Config>,
    classifier: Arc<Classifier>,
    registry: Arc<CancelRegistry>,
    writer: ResponseWriter,
    session: Option<Session>,
}

impl Worker {
    fn run(mut self, jobs: Receiver<Job>) -> Result<()> {
        for job in jobs {
            match job {
                Job::Handle(request) => {
                    let response = self.handle(request)?;
                    self.writer.send(&response)?;
                }
                Job::Reply(response) => self.writer.send(&response)?,
                Job::Close => {
                    self.close_session();
                    let response =
                        Response::status(ResponseKind::CloseResult, &StatusPayload::ok("Connection closed"))?;
                    return self.writer.send(&response);
                }
                Job::EndOfInput => break,
            }
        }
        self.close_session();
        Ok(())
    }

    fn handle(&mut self, request: Request) -> Result<Response> {
        debug!(request = request.kind(), "handling request");
        match request {
            Request::Connect { dsn } => {
                let dsn = dsn.unwrap_or_else(|| self.config.connection.default_dsn.clone());
                self.connect(&dsn)
            }
            Request::Execute {
                sql,
                result_set_id,
                max_rows,
            } => {
                let request = QueryRequest {
                    sql,
                    result_set_id,
                    max_rows,
                };
                let result = match self.session.as_mut() {
                    Some(session) => session.execute(&request),
                    None => QueryResult::Failure(QueryFailure::message("Not connected")),
                };
                Response::execute(&request.result_set_id, &result)
            }
            Request::Reconnect {} => self.reconnect(),
            Request::Cancel { result_set_id } => {
                let outcome = self.registry.cancel(result_set_id.as_deref());
                Response::cancel(&outcome)
            }
            Request::Close {} => {
                self.close_session();
                Response::status(ResponseKind::CloseResult, &StatusPayload::ok("Connection closed"))
            }
        }
    }

    fn connect(&mut self, dsn: &str) -> Result<Response> {
        self.close_session();
        let opened = Session::open(
            Arc::clone(&self.driver),
            &self.config,
            dsn,
            Arc::clone(&self.classifier),
            Arc::clone(&self.registry),
        );
        let payload = match opened {
            Ok(session) => {
                self.session = Some(session);
                StatusPayload::ok(format!("Connected to {}", dsn))
            }
            Err(err) => self.connection_failure(&err),
        };
        Response::status(ResponseKind::ConnectResult, &payload)
    }

    fn reconnect(&mut self) -> Result<Response> {
        let reconnected = self
            .session
            .as_mut()
            .map(|session| session.reconnect().map(|()| session.dsn().to_string()));
        let payload = match reconnected {
            None => StatusPayload::failed("Not connected"),
            Some(Ok(dsn)) => StatusPayload::ok(format!("Reconnected to {}", dsn)),
            Some(Err(err)) => self.connection_failure(&err),
        };
        Response::status(ResponseKind::ReconnectResult, &payload)
    }

    fn connection_failure(&self, err: &BridgeError) -> StatusPayload {
        StatusPayload {
            error_type: Some(CONNECTION_ERROR_TYPE.to_string()),
            raw_error: err.raw_text().map(str::to_string),
            traceback: Some(format!("{:?}", err)),
            ..StatusPayload::failed(Session::connect_failure_message(&self.config, err))
        }
    }

    fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }
}
