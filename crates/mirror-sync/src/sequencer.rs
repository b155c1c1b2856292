use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDecision {
    Applied { watermark: u64 },
    /// Applied, but earlier seqs never arrived.
    Gap { watermark: u64, incoming: u64 },
    Duplicate { watermark: u64 },
}

impl ApplyDecision {
    #[must_use]
    pub fn should_apply(self) -> bool {
        !matches!(self, Self::Duplicate { .. })
    }
}

/// Per-run `seq` watermarks for pushed chat events.
#[derive(Debug, Clone, Default)]
pub struct RunSequencer {
    runs: HashMap<String, u64>,
}

impl RunSequencer {
    #[must_use]
    pub fn watermark(&self, run_id: &str) -> Option<u64> {
        self.runs.get(run_id).copied()
    }

    #[must_use]
    pub fn inspect(&self, run_id: &str, seq: u64) -> ApplyDecision {
        match self.runs.get(run_id).copied() {
            None => ApplyDecision::Applied { watermark: seq },
            Some(watermark) if seq <= watermark => ApplyDecision::Duplicate { watermark },
            Some(watermark) if seq != watermark.saturating_add(1) => ApplyDecision::Gap {
                watermark,
                incoming: seq,
            },
            Some(_) => ApplyDecision::Applied { watermark: seq },
        }
    }

    pub fn apply(&mut self, run_id: &str, seq: u64) -> ApplyDecision {
        let decision = self.inspect(run_id, seq);
        if decision.should_apply() {
            self.runs.insert(run_id.to_string(), seq);
        }
        decision
    }

    pub fn forget(&mut self, run_id: &str) {
        self.runs.remove(run_id);
    }

    pub fn clear(&mut self) {
        self.runs.clear();
    }
}
