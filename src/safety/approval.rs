//! Approval Channels
//!
//! An [`ApprovalChannel`] is asked to decide on operations whose risk
//! reaches the policy threshold. Channels collect one vote per approver;
//! the safety controller applies the quorum rule to the votes.
//!
//! # Channels
//!
//! - [`CallbackApproval`]: decides with a closure (automation and tests)
//! - [`InteractiveApproval`]: prompts an operator on a terminal

use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::{mpsc, Arc};
use std::thread;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colored::*;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};

use super::risk::{Operation, RiskAssessment, RiskLevel};

/// Identity recorded for votes cast without a name.
pub const ANONYMOUS_APPROVER: &str = "anonymous";

/// What an approval channel is asked to decide.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub operation: Operation,
    pub assessment: RiskAssessment,
    /// Distinct approvals needed for the operation to proceed
    pub required_approvers: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Deny,
}

/// One approver's decision.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApprovalVote {
    pub approver: String,
    pub decision: VoteDecision,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ApprovalVote {
    pub fn approve(approver: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
            decision: VoteDecision::Approve,
            reason: None,
        }
    }

    pub fn deny(approver: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
            decision: VoteDecision::Deny,
            reason: Some(reason.into()),
        }
    }

    /// Whether the vote was cast without an approver name.
    pub fn is_anonymous(&self) -> bool {
        self.approver.trim().is_empty()
    }

    /// Trimmed approver name, or [`ANONYMOUS_APPROVER`] when blank.
    pub fn approver_identity(&self) -> String {
        let name = self.approver.trim();
        if name.is_empty() {
            ANONYMOUS_APPROVER.to_string()
        } else {
            name.to_string()
        }
    }
}

/// Votes returned by a channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApprovalResponse {
    pub votes: Vec<ApprovalVote>,
}

impl ApprovalResponse {
    pub fn new(votes: Vec<ApprovalVote>) -> Self {
        Self { votes }
    }

    pub fn single(vote: ApprovalVote) -> Self {
        Self { votes: vec![vote] }
    }
}

/// Final decision on an approval request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "APPROVED"),
            Self::Denied => write!(f, "DENIED"),
        }
    }
}

/// Ledger entry for every approval decision the controller made.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApprovalRecord {
    pub operation_id: String,
    pub risk_level: RiskLevel,
    pub decision: ApprovalDecision,
    /// Distinct approvers whose approval counted
    pub approvers: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Source of approval decisions.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalResponse;
}

type DecideFn = dyn Fn(&ApprovalRequest) -> ApprovalResponse + Send + Sync;

/// Channel backed by a closure.
#[derive(Clone)]
pub struct CallbackApproval {
    decide: Arc<DecideFn>,
}

impl CallbackApproval {
    pub fn new<F>(decide: F) -> Self
    where
        F: Fn(&ApprovalRequest) -> ApprovalResponse + Send + Sync + 'static,
    {
        Self {
            decide: Arc::new(decide),
        }
    }

    /// Approves everything with as many distinct approvers as requested.
    pub fn approve_all() -> Self {
        Self::new(|request| {
            let votes = (1..=request.required_approvers.max(1))
                .map(|i| ApprovalVote::approve(format!("approver-{}", i)))
                .collect();
            ApprovalResponse::new(votes)
        })
    }

    /// Denies everything with the given reason.
    pub fn deny_all(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(move |_| ApprovalResponse::single(ApprovalVote::deny("policy-bot", reason.clone())))
    }
}

impl fmt::Debug for CallbackApproval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackApproval").finish_non_exhaustive()
    }
}

#[async_trait]
impl ApprovalChannel for CallbackApproval {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalResponse {
        (self.decide)(request)
    }
}

type LineReply = oneshot::Sender<io::Result<Option<String>>>;

/// Reads input lines on a dedicated thread, one per request.
///
/// A request whose receiver was dropped (its prompt timed out) hands the
/// line it was waiting for to the next queued request. The thread is not
/// part of the async runtime and never delays its shutdown.
struct LineReader {
    requests: mpsc::Sender<LineReply>,
}

impl LineReader {
    fn spawn<R>(mut input: R) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let (requests, queue) = mpsc::channel::<LineReply>();
        let spawned = thread::Builder::new()
            .name("approval-input".to_string())
            .spawn(move || {
                while let Ok(mut reply) = queue.recv() {
                    let line = read_line(&mut input);
                    while reply.is_closed() {
                        match queue.try_recv() {
                            Ok(next) => reply = next,
                            Err(_) => break,
                        }
                    }
                    let finished = !matches!(line, Ok(Some(_)));
                    if reply.send(line).is_err() {
                        debug!("Discarding approval input for an expired prompt");
                    }
                    if finished {
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to start approval input reader: {}", e);
        }
        Self { requests }
    }

    /// Next trimmed line; `None` at end of input.
    async fn next_line(&self) -> io::Result<Option<String>> {
        let (reply, answer) = oneshot::channel();
        if self.requests.send(reply).is_err() {
            return Ok(None);
        }
        answer.await.unwrap_or(Ok(None))
    }
}

struct PromptIo {
    input: LineReader,
    output: Box<dyn Write + Send>,
}

/// Terminal prompt asking one operator per required approver.
///
/// Prompts are serialized; a prompt abandoned on timeout releases the
/// terminal to the next request.
#[derive(Clone)]
pub struct InteractiveApproval {
    io: Arc<Mutex<PromptIo>>,
}

impl InteractiveApproval {
    /// Prompts on stdin/stdout.
    pub fn new() -> Self {
        Self::with_io(BufReader::new(io::stdin()), io::stdout())
    }

    /// Prompts on arbitrary streams.
    pub fn with_io<R, W>(input: R, output: W) -> Self
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            io: Arc::new(Mutex::new(PromptIo {
                input: LineReader::spawn(input),
                output: Box::new(output),
            })),
        }
    }
}

impl Default for InteractiveApproval {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InteractiveApproval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteractiveApproval").finish_non_exhaustive()
    }
}

#[async_trait]
impl ApprovalChannel for InteractiveApproval {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalResponse {
        let mut io = self.io.lock().await;
        match prompt(&mut io, request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Approval prompt failed: {}", e);
                ApprovalResponse::single(ApprovalVote::deny("", format!("prompt failed: {}", e)))
            }
        }
    }
}

async fn prompt(io: &mut PromptIo, request: &ApprovalRequest) -> io::Result<ApprovalResponse> {
    let assessment = &request.assessment;
    let level = match assessment.risk_level {
        RiskLevel::Critical => assessment.risk_level.to_string().red().bold(),
        RiskLevel::High => assessment.risk_level.to_string().yellow().bold(),
        _ => assessment.risk_level.to_string().normal(),
    };

    let out = &mut io.output;
    writeln!(out)?;
    writeln!(out, "{}", "Approval required".bold())?;
    writeln!(out, "  Operation: {}", request.operation.id)?;
    writeln!(out, "  Category:  {}", request.operation.category)?;
    writeln!(out, "  Risk:      {}", level)?;
    writeln!(out, "  Statement: {}", request.operation.statement.cyan())?;
    if !assessment.matched_patterns.is_empty() {
        writeln!(out, "  Patterns:  {}", assessment.matched_patterns.join(", "))?;
    }
    if request.required_approvers > 1 {
        writeln!(out, "  {} distinct approvals required", request.required_approvers)?;
    }

    let mut votes = Vec::new();
    for n in 1..=request.required_approvers.max(1) {
        write!(io.output, "Approver {} name: ", n)?;
        io.output.flush()?;
        let Some(name) = io.input.next_line().await? else {
            votes.push(ApprovalVote::deny("", "no input"));
            break;
        };

        write!(io.output, "Approve? [y/N]: ")?;
        io.output.flush()?;
        let answer = io.input.next_line().await?.unwrap_or_default();

        if matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes") {
            votes.push(ApprovalVote::approve(name));
        } else {
            votes.push(ApprovalVote::deny(name, "declined at prompt"));
            break;
        }
    }

    Ok(ApprovalResponse::new(votes))
}

/// Reads one trimmed line; `None` at end of input.
fn read_line<R: BufRead>(input: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}
