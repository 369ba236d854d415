//! Worker activity selection

use rand::Rng;

/// Number of equally likely outcomes of one roll
pub const OUTCOMES: u32 = 9;

/// One step of a worker's loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Allocate,
    Free,
    TouchWrite,
    TouchRead,
    SelfTerminate,
    /// Probe reached through its first outcome
    Probe,
    /// Probe reached through its second outcome
    ProbeRepeat,
    IoRoundTrip,
    Idle,
}

impl Activity {
    /// Map an outcome in `0..OUTCOMES` to an activity
    ///
    /// The probe owns two outcomes, every other activity one.
    pub fn from_roll(roll: u32) -> Self {
        match roll {
            0 => Activity::Allocate,
            1 => Activity::Free,
            2 => Activity::TouchWrite,
            3 => Activity::TouchRead,
            4 => Activity::SelfTerminate,
            5 => Activity::Probe,
            6 => Activity::ProbeRepeat,
            7 => Activity::IoRoundTrip,
            _ => Activity::Idle,
        }
    }

    pub fn pick<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::from_roll(rng.gen_range(0..OUTCOMES))
    }

    pub fn is_probe(self) -> bool {
        matches!(self, Activity::Probe | Activity::ProbeRepeat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_every_outcome_maps_once() {
        let all: Vec<_> = (0..OUTCOMES).map(Activity::from_roll).collect();
        assert_eq!(all.iter().filter(|a| a.is_probe()).count(), 2);
        assert_eq!(all.iter().filter(|a| **a == Activity::Idle).count(), 1);
        assert_eq!(all.iter().filter(|a| **a == Activity::IoRoundTrip).count(), 1);
    }

    #[test]
    fn test_probe_weighted_twice() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let rolls = 90_000;
        let mut probes = 0;
        let mut allocs = 0;
        for _ in 0..rolls {
            match Activity::pick(&mut rng) {
                a if a.is_probe() => probes += 1,
                Activity::Allocate => allocs += 1,
                _ => {}
            }
        }
        // Expected 20_000 vs 10_000
        assert!((18_000..22_000).contains(&probes), "probes={}", probes);
        assert!((9_000..11_000).contains(&allocs), "allocs={}", allocs);
    }
}
