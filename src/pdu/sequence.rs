use std::sync::atomic::{AtomicI64, Ordering};

/// Source of message sequence numbers. Every constructed message draws the next number, across all
///  channels sharing the generator.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    last: AtomicI64,
}

impl SequenceGenerator {
    pub fn new() -> SequenceGenerator {
        Default::default()
    }

    pub fn starting_at(first: i64) -> SequenceGenerator {
        SequenceGenerator {
            last: AtomicI64::new(first - 1),
        }
    }

    pub fn next(&self) -> i64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_monotonic() {
        let generator = SequenceGenerator::new();
        assert_eq!(generator.next(), 1);
        assert_eq!(generator.next(), 2);
        assert_eq!(generator.current(), 2);

        let generator = SequenceGenerator::starting_at(100);
        assert_eq!(generator.next(), 100);
    }

    #[tokio::test]
    async fn test_concurrent_draws_are_distinct() {
        let generator = Arc::new(SequenceGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let generator = generator.clone();
            handles.push(tokio::spawn(async move {
                (0..100).map(|_| generator.next()).collect::<Vec<_>>()
            }));
        }

        let mut all = BTreeSet::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        assert_eq!(all.len(), 800);
        assert_eq!(all.last(), Some(&800));
    }
}
