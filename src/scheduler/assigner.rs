use crate::scheduler::NodeRef;

/// A node able to take the job under consideration, with its weighted load.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub node: NodeRef,
    pub score: f64,
}

impl Candidate {
    /// The local node is weighted 1.0.
    pub fn local(depth: usize) -> Self {
        Self {
            node: NodeRef::Local,
            score: depth as f64,
        }
    }

    /// Higher efficiency means a lower score, so more capable workers win ties on raw depth.
    pub fn remote(host: impl Into<String>, queue_size: usize, efficiency: f64) -> Self {
        let efficiency = if efficiency > 0.0 { efficiency } else { 1.0 };
        Self {
            node: NodeRef::Remote(host.into()),
            score: queue_size as f64 / efficiency,
        }
    }
}

/// Orders candidates by ascending score. The sort is stable, so equal scores keep
/// insertion order (local first, then workers in configuration order).
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| a.score.total_cmp(&b.score));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(ranked: &[Candidate]) -> Vec<String> {
        ranked.iter().map(|c| c.node.to_string()).collect()
    }

    #[test]
    fn efficiency_scales_queue_depth() {
        let ranked = rank(vec![
            Candidate::remote("a", 5, 1.0),
            Candidate::remote("b", 3, 2.0),
        ]);
        assert_eq!(hosts(&ranked), vec!["b", "a"]);
        assert_eq!(ranked[0].score, 1.5);
        assert_eq!(ranked[1].score, 5.0);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let ranked = rank(vec![
            Candidate::local(2),
            Candidate::remote("a", 2, 1.0),
            Candidate::remote("b", 4, 2.0),
        ]);
        assert_eq!(hosts(&ranked), vec!["local", "a", "b"]);

        // same snapshot, same answer
        let again = rank(vec![
            Candidate::local(2),
            Candidate::remote("a", 2, 1.0),
            Candidate::remote("b", 4, 2.0),
        ]);
        assert_eq!(ranked, again);
    }

    #[test]
    fn idle_worker_beats_busy_local() {
        let ranked = rank(vec![Candidate::local(3), Candidate::remote("w", 0, 1.0)]);
        assert_eq!(ranked[0].node, NodeRef::Remote("w".into()));
    }

    #[test]
    fn non_positive_efficiency_falls_back_to_one() {
        assert_eq!(Candidate::remote("w", 4, 0.0).score, 4.0);
        assert_eq!(Candidate::remote("w", 4, -2.0).score, 4.0);
    }

    #[test]
    fn empty_set() {
        assert!(rank(Vec::new()).is_empty());
    }
}
