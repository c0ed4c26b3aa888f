/// Weighted File Selector
///
/// Picks the next source file across three weighting tiers (suppressed,
/// neutral, boosted) with starvation-free fairness: within a super-cycle
/// every suppressed file plays once, every neutral file `s` times and every
/// boosted file `s·b` times, so long-run per-file frequencies hold the
/// `1 : s : s·b` ratio by construction. Tier choice per call is a draw
/// proportional to each tier's remaining plays in the current super-cycle,
/// which keeps the ratio correct even while tiers are mid-iteration.
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

use rand::Rng;
use thiserror::Error;

use crate::library::LibraryEntry;
use crate::settings::Settings;

/// Hard cap on the anti-repeat window; small pools use half their size.
pub const RECENT_WINDOW_CAP: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Suppressed,
    Neutral,
    Boosted,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Suppressed, Tier::Neutral, Tier::Boosted];

    fn label(self) -> &'static str {
        match self {
            Tier::Suppressed => "suppressed",
            Tier::Neutral => "neutral",
            Tier::Boosted => "boosted",
        }
    }
}

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no eligible files remain in any tier")]
    NoEligibleFiles,
}

/// Classify the non-excluded listing into the three tiers. A file matching
/// both the boost and suppress predicates nets out to neutral.
pub(crate) fn partition(
    listing: &[LibraryEntry],
    settings: &Settings,
) -> (Vec<PathBuf>, Vec<PathBuf>, Vec<PathBuf>) {
    let mut suppressed = Vec::new();
    let mut neutral = Vec::new();
    let mut boosted = Vec::new();

    for entry in listing {
        let is_boosted = !settings.boosted.is_empty() && settings.boosted.matches(&entry.rel_lower);
        let is_suppressed =
            !settings.suppressed.is_empty() && settings.suppressed.matches(&entry.rel_lower);
        match (is_boosted, is_suppressed) {
            (true, false) => boosted.push(entry.path.clone()),
            (false, true) => suppressed.push(entry.path.clone()),
            // Boost and suppress cancel out.
            _ => neutral.push(entry.path.clone()),
        }
    }

    (suppressed, neutral, boosted)
}

// ── FileGroup ─────────────────────────────────────────────────────────────────

/// Fairness state for one tier.
#[derive(Debug, Default)]
struct FileGroup {
    tier_label: &'static str,
    files: Vec<PathBuf>,
    /// Files already played in the current iteration.
    played: HashSet<PathBuf>,
    /// Most recent picks, newest last; survives iteration boundaries.
    recent: VecDeque<PathBuf>,
    /// Index of the current iteration within the super-cycle.
    iteration: u32,
    /// How many times each file plays per super-cycle.
    plays_per_cycle: u32,
}

impl FileGroup {
    fn new(tier: Tier) -> Self {
        Self { tier_label: tier.label(), plays_per_cycle: 1, ..Default::default() }
    }

    /// Refresh the candidate set and weighting without losing fairness
    /// state for files that are still present.
    fn set_candidates(&mut self, files: Vec<PathBuf>, plays_per_cycle: u32) {
        let plays_per_cycle = plays_per_cycle.max(1);
        if plays_per_cycle != self.plays_per_cycle {
            self.plays_per_cycle = plays_per_cycle;
            if self.iteration >= plays_per_cycle {
                self.reset_cycle();
            }
        }
        if files != self.files {
            let present: HashSet<&PathBuf> = files.iter().collect();
            self.played.retain(|f| present.contains(f));
            self.recent.retain(|f| present.contains(f));
            self.files = files;
        }
    }

    fn remaining_in_iteration(&self) -> usize {
        self.files.len() - self.played.len()
    }

    /// Remaining picks across the current iteration and every pending one.
    fn remaining_total(&self) -> usize {
        if self.files.is_empty() {
            return 0;
        }
        let pending = self.plays_per_cycle.saturating_sub(1 + self.iteration) as usize;
        self.remaining_in_iteration() + self.files.len() * pending
    }

    fn advance_iteration(&mut self) {
        self.iteration = (self.iteration + 1).min(self.plays_per_cycle.saturating_sub(1));
        self.played.clear();
    }

    fn reset_cycle(&mut self) {
        self.iteration = 0;
        self.played.clear();
    }

    fn window_len(&self) -> usize {
        RECENT_WINDOW_CAP.min(self.files.len() / 2)
    }

    fn pick<R: Rng>(&mut self, rng: &mut R) -> Option<PathBuf> {
        for _ in 0..2 {
            if self.files.is_empty() {
                return None;
            }

            let unplayed: Vec<&PathBuf> =
                self.files.iter().filter(|f| !self.played.contains(*f)).collect();
            if unplayed.is_empty() {
                // The caller drew this tier off a nonzero remaining count,
                // so an exhausted iteration here is an accounting bug.
                log::warn!(
                    "selector: {} tier drawn with an exhausted iteration, advancing defensively",
                    self.tier_label
                );
                self.advance_iteration();
                continue;
            }

            let window: HashSet<&PathBuf> = self.recent.iter().rev().take(self.window_len()).collect();
            let eligible: Vec<&PathBuf> =
                unplayed.iter().filter(|f| !window.contains(*f)).copied().collect();
            // When the window covers every unplayed file, repeating one is
            // unavoidable.
            let pool = if eligible.is_empty() { &unplayed } else { &eligible };

            let choice = pool[rng.gen_range(0..pool.len())].clone();
            self.played.insert(choice.clone());
            self.recent.push_back(choice.clone());
            while self.recent.len() > RECENT_WINDOW_CAP {
                self.recent.pop_front();
            }

            if self.remaining_in_iteration() == 0 && self.iteration + 1 < self.plays_per_cycle {
                self.advance_iteration();
            }
            return Some(choice);
        }
        None
    }
}

// ── FileSelector ──────────────────────────────────────────────────────────────

pub struct FileSelector {
    suppressed: FileGroup,
    neutral: FileGroup,
    boosted: FileGroup,
}

impl Default for FileSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSelector {
    pub fn new() -> Self {
        Self {
            suppressed: FileGroup::new(Tier::Suppressed),
            neutral: FileGroup::new(Tier::Neutral),
            boosted: FileGroup::new(Tier::Boosted),
        }
    }

    fn group_mut(&mut self, tier: Tier) -> &mut FileGroup {
        match tier {
            Tier::Suppressed => &mut self.suppressed,
            Tier::Neutral => &mut self.neutral,
            Tier::Boosted => &mut self.boosted,
        }
    }

    fn remaining(&self, tier: Tier) -> usize {
        match tier {
            Tier::Suppressed => self.suppressed.remaining_total(),
            Tier::Neutral => self.neutral.remaining_total(),
            Tier::Boosted => self.boosted.remaining_total(),
        }
    }

    /// Select one file. `listing` is the current non-excluded library scan;
    /// tier membership and weighting follow the given settings snapshot.
    pub fn select<R: Rng>(
        &mut self,
        listing: &[LibraryEntry],
        settings: &Settings,
        rng: &mut R,
    ) -> Result<PathBuf, SelectError> {
        let (sup, neu, boo) = partition(listing, settings);
        let s = settings.suppressed_factor.max(1);
        let b = settings.boosted_factor.max(1);
        self.suppressed.set_candidates(sup, 1);
        self.neutral.set_candidates(neu, s);
        self.boosted.set_candidates(boo, s * b);

        // Synchronized super-cycle reset: only when every tier has drained
        // does the whole structure start over, preserving relative weights.
        if Tier::ALL.iter().all(|t| self.remaining(*t) == 0) {
            self.suppressed.reset_cycle();
            self.neutral.reset_cycle();
            self.boosted.reset_cycle();
        }

        let total: usize = Tier::ALL.iter().map(|t| self.remaining(*t)).sum();
        if total == 0 {
            return Err(SelectError::NoEligibleFiles);
        }

        let mut target = rng.gen_range(0..total);
        let mut chosen = Tier::Neutral;
        for tier in Tier::ALL {
            let remaining = self.remaining(tier);
            if target < remaining {
                chosen = tier;
                break;
            }
            target -= remaining;
        }

        self.group_mut(chosen).pick(rng).ok_or(SelectError::NoEligibleFiles)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
