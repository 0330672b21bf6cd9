//! The `ListRecords` harvesting state machine.
//!
//! ```text
//! Start ──start()──▶ AwaitingResponse ──page with token──▶ AwaitingResponse
//!                          │   │
//!                          │   └──page without token──▶ Done
//!                          └──protocol/transport error──▶ Failed
//! ```
//!
//! A session has at most one request in flight. The follow-up request for
//! a resumption token is only issued after every record of the current
//! page has been handed to the [`RecordSink`]. When a shutdown signal is
//! observed between pages the machine stops in `Cancelled`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HarvestError, Result};
use crate::models::{HarvestContext, HarvestWindow, RawRecord};
use crate::oai::{parse_list_records, Page};
use crate::transport::Transport;

pub const VERB: &str = "ListRecords";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestState {
    Start,
    AwaitingResponse,
    Done,
    Failed,
    Cancelled,
}

impl HarvestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HarvestState::Done | HarvestState::Failed | HarvestState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestState::Start => "start",
            HarvestState::AwaitingResponse => "awaiting-response",
            HarvestState::Done => "done",
            HarvestState::Failed => "failed",
            HarvestState::Cancelled => "cancelled",
        }
    }
}

/// Query parameters of one `ListRecords` request, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRecordsRequest {
    params: Vec<(String, String)>,
}

impl ListRecordsRequest {
    /// The first request of a session: verb, set, prefix and date window.
    pub fn initial(ctx: &HarvestContext, window: &HarvestWindow) -> Self {
        let mut params = vec![("verb".to_string(), VERB.to_string())];
        if let Some(ref set) = ctx.set_spec {
            params.push(("set".to_string(), set.clone()));
        }
        params.push(("metadataPrefix".to_string(), ctx.metadata_prefix.clone()));
        if let Some(ref from) = window.from_date {
            params.push(("from".to_string(), ctx.granularity.format(from)));
        }
        if let Some(ref until) = window.until_date {
            params.push(("until".to_string(), ctx.granularity.format(until)));
        }
        Self { params }
    }

    /// A follow-up request. Only the verb and token are sent.
    pub fn resume(token: &str) -> Self {
        Self {
            params: vec![
                ("verb".to_string(), VERB.to_string()),
                ("resumptionToken".to_string(), token.to_string()),
            ],
        }
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Receives the records of a session, in document order.
#[async_trait]
pub trait RecordSink: Send {
    /// Called once per record whose header could be read.
    ///
    /// Returning an error aborts the session before the page's checkpoint
    /// is reported.
    async fn accept(&mut self, record: RawRecord) -> Result<()>;

    /// Called after every record of a page was accepted, with the latest
    /// datestamp seen so far in the session.
    async fn page_complete(&mut self, _checkpoint: Option<DateTime<Utc>>) -> Result<()> {
        Ok(())
    }
}

/// Outcome of handling one response.
#[derive(Debug)]
pub struct PageOutcome {
    pub records: Vec<Result<RawRecord>>,
    /// Follow-up request, if the page carried a resumption token.
    pub next: Option<ListRecordsRequest>,
    /// Set when the body broke off before a token could be read. The
    /// records are still delivered, then the session fails.
    pub truncated: Option<String>,
}

pub struct Harvester {
    ctx: HarvestContext,
    window: HarvestWindow,
    state: HarvestState,
    requests_issued: usize,
    records_seen: usize,
    records_skipped: usize,
    checkpoint: Option<DateTime<Utc>>,
}

impl Harvester {
    /// The window is frozen from here on.
    pub fn new(ctx: HarvestContext, window: HarvestWindow) -> Self {
        Self {
            ctx,
            window,
            state: HarvestState::Start,
            requests_issued: 0,
            records_seen: 0,
            records_skipped: 0,
            checkpoint: None,
        }
    }

    pub fn state(&self) -> HarvestState {
        self.state
    }

    pub fn context(&self) -> &HarvestContext {
        &self.ctx
    }

    pub fn window(&self) -> &HarvestWindow {
        &self.window
    }

    pub fn requests_issued(&self) -> usize {
        self.requests_issued
    }

    pub fn records_seen(&self) -> usize {
        self.records_seen
    }

    /// Records dropped because their header could not be read.
    pub fn records_skipped(&self) -> usize {
        self.records_skipped
    }

    /// Latest record datestamp seen in this session.
    pub fn checkpoint(&self) -> Option<DateTime<Utc>> {
        self.checkpoint
    }

    /// Build the initial request and move to `AwaitingResponse`.
    pub fn start(&mut self) -> Result<ListRecordsRequest> {
        if self.state != HarvestState::Start {
            return Err(HarvestError::config(format!(
                "harvest already started (state: {})",
                self.state.as_str()
            )));
        }
        info!(
            url = %self.ctx.endpoint,
            set = ?self.ctx.set_spec,
            metadata_prefix = %self.ctx.metadata_prefix,
            from = ?self.window.from_date,
            until = ?self.window.until_date,
            "starting harvest"
        );
        self.state = HarvestState::AwaitingResponse;
        Ok(ListRecordsRequest::initial(&self.ctx, &self.window))
    }

    /// Parse one response body.
    ///
    /// A protocol error moves the machine to `Failed`. A page without a
    /// resumption token moves it to `Done`, unless the body broke off, in
    /// which case the missing token proves nothing and the machine moves to
    /// `Failed` with the parsed records still returned.
    pub fn handle_response(&mut self, body: &str) -> Result<PageOutcome> {
        if self.state != HarvestState::AwaitingResponse {
            return Err(HarvestError::config(format!(
                "no request outstanding (state: {})",
                self.state.as_str()
            )));
        }

        let page = match parse_list_records(body).and_then(|r| r.into_page()) {
            Ok(page) => page,
            Err(e) => {
                self.state = HarvestState::Failed;
                return Err(e);
            }
        };

        let Page {
            resumption_token,
            records,
            malformed,
        } = page;
        let mut truncated = None;
        let next = match (resumption_token, malformed) {
            (Some(token), _) => {
                debug!(token = %token, "resumption token");
                Some(ListRecordsRequest::resume(&token))
            }
            (None, Some(reason)) => {
                self.state = HarvestState::Failed;
                truncated = Some(reason);
                None
            }
            (None, None) => {
                self.state = HarvestState::Done;
                None
            }
        };

        Ok(PageOutcome {
            records,
            next,
            truncated,
        })
    }

    /// Fold a record's datestamp into the session checkpoint.
    ///
    /// Records are not guaranteed to arrive in datestamp order, so the
    /// maximum is kept. A missing datestamp leaves the checkpoint alone.
    pub fn observe(&mut self, record: &RawRecord) {
        self.records_seen += 1;
        if let Some(ts) = record.header.datestamp {
            debug!(identifier = %record.header.identifier, datestamp = %ts, "record");
            if self.checkpoint.map_or(true, |cp| ts > cp) {
                self.checkpoint = Some(ts);
            }
        }
    }

    /// Drive the session until it is `Done`, `Failed` or `Cancelled`.
    ///
    /// `shutdown` is checked between pages only; a page that was fetched
    /// is always processed completely.
    pub async fn run<T, S>(
        &mut self,
        transport: &T,
        sink: &mut S,
        shutdown: Option<&CancellationToken>,
    ) -> Result<HarvestState>
    where
        T: Transport + ?Sized,
        S: RecordSink + ?Sized,
    {
        let mut request = self.start()?;

        loop {
            self.requests_issued += 1;
            let body = match transport.fetch(&self.ctx.endpoint, &request).await {
                Ok(body) => body,
                Err(e) => {
                    self.state = HarvestState::Failed;
                    return Err(e);
                }
            };

            let outcome = self.handle_response(&body)?;

            for record in outcome.records {
                match record {
                    Ok(record) => {
                        self.observe(&record);
                        if let Err(e) = sink.accept(record).await {
                            self.state = HarvestState::Failed;
                            return Err(e);
                        }
                    }
                    Err(e) => {
                        self.records_skipped += 1;
                        warn!(error = %e, "skipping unreadable record");
                    }
                }
            }

            if let Some(reason) = outcome.truncated {
                self.state = HarvestState::Failed;
                return Err(HarvestError::Xml(format!(
                    "page broke off without a resumption token: {}",
                    reason
                )));
            }

            if let Err(e) = sink.page_complete(self.checkpoint).await {
                self.state = HarvestState::Failed;
                return Err(e);
            }

            match outcome.next {
                None => {
                    info!(
                        url = %self.ctx.endpoint,
                        requests = self.requests_issued,
                        records = self.records_seen,
                        "harvest complete"
                    );
                    return Ok(self.state);
                }
                Some(next) => {
                    if shutdown.is_some_and(CancellationToken::is_cancelled) {
                        info!(
                            url = %self.ctx.endpoint,
                            requests = self.requests_issued,
                            "shutdown requested; stopping between pages"
                        );
                        self.state = HarvestState::Cancelled;
                        return Ok(self.state);
                    }
                    request = next;
                }
            }
        }
    }
}
