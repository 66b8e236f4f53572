//! Donor selection for capacity reclaim

use crate::config::VictimPolicyKind;

/// Donors tried per reclaim request; bounds the latency of `shrink_cache`
pub const MAX_DONOR_ATTEMPTS: usize = 3;

/// Picks which size classes to ask for capacity on behalf of `recipient`
pub trait VictimPolicy: Send {
    /// Candidate donors, in the order they should be tried. Never contains
    /// `recipient`. `spare(i)` reports the unused capacity of class `i`.
    fn candidates(
        &mut self,
        recipient: usize,
        num_classes: usize,
        spare: &dyn Fn(usize) -> usize,
    ) -> Vec<usize>;
}

/// Build the policy named by the configuration
pub fn from_kind(kind: VictimPolicyKind) -> Box<dyn VictimPolicy> {
    match kind {
        VictimPolicyKind::RoundRobin => Box::new(RoundRobin::default()),
        VictimPolicyKind::MostSpare => Box::new(MostSpare),
    }
}

/// Cycles through the size classes, resuming after the last one tried
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl VictimPolicy for RoundRobin {
    fn candidates(
        &mut self,
        recipient: usize,
        num_classes: usize,
        _spare: &dyn Fn(usize) -> usize,
    ) -> Vec<usize> {
        let mut out = Vec::with_capacity(MAX_DONOR_ATTEMPTS);
        if num_classes < 2 {
            return out;
        }

        let mut visited = 0;
        while out.len() < MAX_DONOR_ATTEMPTS && visited < num_classes {
            let candidate = self.next % num_classes;
            self.next = (candidate + 1) % num_classes;
            visited += 1;
            if candidate != recipient {
                out.push(candidate);
            }
        }
        out
    }
}

/// Prefers the classes with the most unused capacity
#[derive(Debug, Default)]
pub struct MostSpare;

impl VictimPolicy for MostSpare {
    fn candidates(
        &mut self,
        recipient: usize,
        num_classes: usize,
        spare: &dyn Fn(usize) -> usize,
    ) -> Vec<usize> {
        let mut ranked: Vec<(usize, usize)> = (0..num_classes)
            .filter(|&i| i != recipient)
            .map(|i| (spare(i), i))
            .filter(|&(s, _)| s > 0)
            .collect();
        // Most spare first; lower class index breaks ties
        ranked.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ranked
            .into_iter()
            .take(MAX_DONOR_ATTEMPTS)
            .map(|(_, i)| i)
            .collect()
    }
}
