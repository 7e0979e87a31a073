//! `GetShuffleWorkers` allocation: snapshot the live Worker pool, fail empty,
//! clamp the requested count to the configured bounds, then pick a
//! weighted-random sample without replacement.

use rand::Rng;
use rss_common::error::RssError;
use rss_common::model::WorkerDetail;

/// Weighted sampling without replacement via the exponential-clock variant of
/// the Efraimidis-Spirakis scheme: each Worker draws a key
/// `-ln(U) / weight` for `U ~ Uniform(0, 1)`, and the Workers with the
/// smallest keys are selected. Equivalent in distribution to the priority
/// sampling originally described with keys `U^(1/weight)` but avoids the
/// numerical underflow that scheme suffers for large weights.
fn weighted_sample_without_replacement<R: Rng + ?Sized>(
    workers: &[WorkerDetail],
    count: usize,
    rng: &mut R,
) -> Vec<WorkerDetail> {
    let mut keyed: Vec<(f64, &WorkerDetail)> = workers
        .iter()
        .map(|w| {
            let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
            let weight = w.weight.max(1) as f64;
            (-u.ln() / weight, w)
        })
        .collect();

    keyed.sort_by(|(ka, a), (kb, b)| {
        ka.partial_cmp(kb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.last_heartbeat_millis.cmp(&a.last_heartbeat_millis))
            .then_with(|| a.key().cmp(&b.key()))
    });

    keyed.into_iter().take(count).map(|(_, w)| w.clone()).collect()
}

/// Allocate up to `requested_count` Workers from `live_workers`, clamped to
/// `[min_server_count, max_server_count]`. Fails with `NoShuffleWorkersError`
/// if the live pool is empty; otherwise always returns at least one Worker,
/// fewer than requested if the live pool is smaller than the clamped count.
pub fn allocate(
    live_workers: &[WorkerDetail],
    requested_count: u32,
    min_server_count: u32,
    max_server_count: u32,
) -> Result<Vec<WorkerDetail>, RssError> {
    let mut rng = rand::thread_rng();
    allocate_with_rng(live_workers, requested_count, min_server_count, max_server_count, &mut rng)
}

pub fn allocate_with_rng<R: Rng + ?Sized>(
    live_workers: &[WorkerDetail],
    requested_count: u32,
    min_server_count: u32,
    max_server_count: u32,
    rng: &mut R,
) -> Result<Vec<WorkerDetail>, RssError> {
    if live_workers.is_empty() {
        return Err(RssError::NoShuffleWorkersError);
    }

    let clamped = requested_count.clamp(min_server_count, max_server_count) as usize;
    let count = clamped.min(live_workers.len());

    Ok(weighted_sample_without_replacement(live_workers, count, rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn worker(host: &str, weight: u32) -> WorkerDetail {
        WorkerDetail {
            host: host.to_string(),
            data_port: 7000,
            control_port: 7001,
            weight,
            datacenter: "dc1".to_string(),
            cluster: "prod".to_string(),
            last_heartbeat_millis: 0,
        }
    }

    #[test]
    fn empty_pool_is_an_error() {
        let err = allocate(&[], 3, 1, 10).unwrap_err();
        assert!(matches!(err, RssError::NoShuffleWorkersError));
    }

    #[test]
    fn requested_count_is_clamped_to_bounds() {
        let workers: Vec<_> = (0..20).map(|i| worker(&format!("h{i}"), 1)).collect();
        let mut rng = StdRng::seed_from_u64(42);
        let picked = allocate_with_rng(&workers, 1, 5, 10, &mut rng).unwrap();
        assert_eq!(picked.len(), 5);

        let mut rng = StdRng::seed_from_u64(42);
        let picked = allocate_with_rng(&workers, 100, 5, 10, &mut rng).unwrap();
        assert_eq!(picked.len(), 10);
    }

    #[test]
    fn never_returns_more_than_the_live_pool() {
        let workers = vec![worker("a", 1), worker("b", 1)];
        let mut rng = StdRng::seed_from_u64(7);
        let picked = allocate_with_rng(&workers, 10, 1, 64, &mut rng).unwrap();
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn selection_has_no_duplicates() {
        let workers: Vec<_> = (0..30).map(|i| worker(&format!("h{i}"), (i + 1) as u32)).collect();
        let mut rng = StdRng::seed_from_u64(99);
        let picked = allocate_with_rng(&workers, 12, 1, 64, &mut rng).unwrap();
        assert_eq!(picked.len(), 12);
        let mut keys: Vec<String> = picked.iter().map(|w| w.key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 12);
    }

    #[test]
    fn heavier_weight_is_selected_more_often_over_many_trials() {
        let workers = vec![worker("heavy", 100), worker("light", 1)];
        let mut heavy_wins = 0;
        for seed in 0..200u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let picked = allocate_with_rng(&workers, 1, 1, 64, &mut rng).unwrap();
            if picked[0].host == "heavy" {
                heavy_wins += 1;
            }
        }
        assert!(heavy_wins > 150, "expected heavy worker to dominate single-pick trials, got {heavy_wins}/200");
    }
}
