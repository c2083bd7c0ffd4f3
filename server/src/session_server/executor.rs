//! Query executor: drives one query to completion on its own thread.
//!
//! The executor works on the handle it was spawned with, never on the
//! session's live field. Table and row callbacks are dropped once the query is
//! cancelled; messages and row counts always go through. Either way the run is
//! drained to its natural end.
//!
//! Driver errors are never shown to the client. A failed run ends in one of:
//! - handle no longer usable: implicit logout, no `query_finished`
//! - handle still current: a bare `query_finished`
//! - handle replaced meanwhile: nothing

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, MutexGuard};

use tdsweb_protocol::{QueryFinishedMessage, ServerMessage};
use tdsweb_tds::{Column, ResultHandler, ServerNotice, SinkError, Value};

use crate::session_server::outbox::Outbox;
use crate::session_server::session::{info_message, logout_locked, LiveHandle, SessionState};
use crate::session_server::sink::ResultSink;

/// How a query ended, as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Ran to completion; `query_finished` was sent.
    Finished,
    /// Cancelled and drained; `query_finished` was sent.
    Cancelled,
    /// The run failed on a usable handle; a bare `query_finished` was sent.
    Failed,
    /// The handle broke; the session was logged out.
    ConnectionLost,
    /// The session's handle changed while the query ran; nothing was sent.
    Superseded,
}

/// Run-once worker for a single query.
pub struct QueryExecutor {
    handle: LiveHandle,
    text: String,
    sink: ResultSink,
    cancelled: Arc<AtomicBool>,
    shared: Arc<Mutex<SessionState>>,
    outbox: Outbox,
}

impl QueryExecutor {
    pub(crate) fn new(
        handle: LiveHandle,
        text: String,
        sink: ResultSink,
        cancelled: Arc<AtomicBool>,
        shared: Arc<Mutex<SessionState>>,
        outbox: Outbox,
    ) -> Self {
        Self { handle, text, sink, cancelled, shared, outbox }
    }

    /// Start the query thread. The session must already be marked active.
    pub fn spawn(self) -> io::Result<JoinHandle<QueryOutcome>> {
        thread::Builder::new()
            .name(format!("tdsweb-query-{}", self.handle.id))
            .spawn(move || self.run())
    }

    fn run(self) -> QueryOutcome {
        let QueryExecutor { handle, text, mut sink, cancelled, shared, outbox } = self;

        let result = {
            let mut forwarder = Forwarder {
                sink: &mut sink,
                outbox: &outbox,
                shared: &shared,
                handle_id: handle.id,
                cancelled: &cancelled,
            };
            handle.conn.run(&text, &mut forwarder)
        };
        let was_cancelled = cancelled.load(Ordering::SeqCst);

        let outcome = match result {
            Err(err) if !handle.conn.is_usable() => {
                log::debug!("Query failed, connection unusable: {}", err);
                let mut state = shared.lock();
                let outcome = if state.is_current(handle.id) {
                    log::warn!("Lost database connection, logging out");
                    logout_locked(&mut state, &outbox);
                    QueryOutcome::ConnectionLost
                } else {
                    QueryOutcome::Superseded
                };
                state.active = false;
                outcome
            }
            Err(err) => {
                log::debug!("Query failed: {}", err);
                let outcome = if was_cancelled { QueryOutcome::Cancelled } else { QueryOutcome::Failed };
                finish(&shared, &outbox, handle.id, QueryFinishedMessage::default(), outcome)
            }
            Ok(()) => {
                let finished = match sink.finish() {
                    Ok(finished) => finished,
                    Err(err) => {
                        log::warn!("Spreadsheet export failed: {}", err);
                        QueryFinishedMessage::default()
                    }
                };
                let outcome = if was_cancelled { QueryOutcome::Cancelled } else { QueryOutcome::Finished };
                finish(&shared, &outbox, handle.id, finished, outcome)
            }
        };

        log::info!("Query ended: {:?}", outcome);
        outcome
    }
}

/// Emit `query_finished` if the handle is still current, and release the
/// session in the same critical section.
fn finish(
    shared: &Mutex<SessionState>,
    outbox: &Outbox,
    handle_id: u64,
    finished: QueryFinishedMessage,
    outcome: QueryOutcome,
) -> QueryOutcome {
    let mut state = shared.lock();
    let outcome = if state.is_current(handle_id) {
        outbox.send(ServerMessage::QueryFinished(finished));
        outcome
    } else {
        QueryOutcome::Superseded
    };
    state.active = false;
    outcome
}

/// Driver callbacks of one run, routed into the sink.
struct Forwarder<'a> {
    sink: &'a mut ResultSink,
    outbox: &'a Outbox,
    shared: &'a Mutex<SessionState>,
    handle_id: u64,
    cancelled: &'a AtomicBool,
}

impl<'a> Forwarder<'a> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait for room in the outbox, then lock the session. `None` if the
    /// connection is gone or the handle is no longer current.
    ///
    /// Never waits while holding the session lock.
    fn lock_current(&self, queues_event: bool) -> Option<MutexGuard<'a, SessionState>> {
        if queues_event && !self.outbox.wait_for_space() {
            return None;
        }
        let shared: &'a Mutex<SessionState> = self.shared;
        let state = shared.lock();
        state.is_current(self.handle_id).then_some(state)
    }
}

impl ResultHandler for Forwarder<'_> {
    fn on_table(&mut self, columns: &[Column]) -> Result<(), SinkError> {
        if self.is_cancelled() {
            return Ok(());
        }
        let streaming = !self.sink.is_spreadsheet();
        let Some(_state) = self.lock_current(streaming) else {
            return Ok(());
        };
        self.sink.on_table(columns)
    }

    fn on_row(&mut self, row: &[Option<Value>]) -> Result<(), SinkError> {
        if self.is_cancelled() {
            return Ok(());
        }
        let streaming = !self.sink.is_spreadsheet();
        let Some(_state) = self.lock_current(streaming) else {
            return Ok(());
        };
        self.sink.on_row(row)
    }

    fn on_message(&mut self, notice: &ServerNotice) -> Result<(), SinkError> {
        if let Some(_state) = self.lock_current(true) {
            self.outbox.send(ServerMessage::Message(info_message(notice)));
        }
        Ok(())
    }

    fn on_row_count(&mut self, count: u64) -> Result<(), SinkError> {
        let streaming = !self.sink.is_spreadsheet();
        if let Some(_state) = self.lock_current(streaming) {
            self.sink.on_row_count(count);
        }
        Ok(())
    }
}
