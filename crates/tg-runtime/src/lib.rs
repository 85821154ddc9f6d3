#![forbid(unsafe_code)]

use std::fmt;

use tg_core::{ChannelStep, TensorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Policy,
    Generate,
    Compute,
    Serialize,
    Write,
    Verify,
}

impl EvidenceKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Generate => "generate",
            Self::Compute => "compute",
            Self::Serialize => "serialize",
            Self::Write => "write",
            Self::Verify => "verify",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u64,
    pub kind: EvidenceKind,
    pub summary: String,
    pub artifact: Option<String>,
    pub token_count: Option<usize>,
    pub failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
            artifact: None,
            token_count: None,
            failed: false,
        });
    }

    pub fn record_failure(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
            artifact: None,
            token_count: None,
            failed: true,
        });
    }

    pub fn record_artifact(
        &mut self,
        kind: EvidenceKind,
        artifact: impl Into<String>,
        token_count: usize,
        summary: impl Into<String>,
    ) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
            artifact: Some(artifact.into()),
            token_count: Some(token_count),
            failed: false,
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.entries.iter().any(|entry| entry.failed)
    }
}

/// Identity and evidence trail of one generation or verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    run_id: String,
    ledger: EvidenceLedger,
}

impl RunContext {
    #[must_use]
    pub fn new(run_id: impl Into<String>, channel_step: ChannelStep) -> Self {
        let run_id = run_id.into();
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!(
                "run {run_id} initialized with channel_step={}",
                channel_step.label()
            ),
        );
        Self { run_id, ledger }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record_generated(&mut self, kind: TensorKind, numel: usize, seed: u64) {
        self.ledger.record(
            EvidenceKind::Generate,
            format!("generated {kind} with {numel} elements from seed {seed}"),
        );
    }

    pub fn record_failure<E>(&mut self, kind: EvidenceKind, stage: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger
            .record_failure(kind, format!("{stage} failed: {error}"));
    }
}

fn now_unix_ms() -> u64 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}
