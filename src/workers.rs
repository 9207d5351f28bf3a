use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::db::{Database, with_busy_retry};
use crate::models::{DiscoveredJob, EnrichmentOutcome};

/// Access to the listing source. Implementations own authentication,
/// fetching and page parsing; the workers only see the shapes below.
pub trait JobSource {
    /// One page of the search listing, or None once the listing is
    /// exhausted (the producer then starts over from page zero).
    fn discover_page(&mut self, page: u32) -> Result<Option<BTreeMap<i64, DiscoveredJob>>>;

    /// Full detail for a batch of job ids. Ids that failed to fetch or
    /// parse come back as the error outcome, not as an Err: a bad page
    /// for one job must not sink the rest of the batch.
    fn fetch_details(&mut self, job_ids: &[i64]) -> Result<BTreeMap<i64, EnrichmentOutcome>>;
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Sleep between cycles when there is nothing to do.
    pub poll_interval: Duration,
    /// How many pending jobs one enrichment cycle takes on.
    pub batch_size: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 25,
        }
    }
}

/// Cooperative stop signal shared with the supervisory layer. Checked
/// between batches only, so an in-flight transaction always commits or
/// rolls back as a unit.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Register one listing page. Returns the page the next cycle should
/// fetch, wrapping to zero when the listing runs out.
pub fn discover_once(db: &mut Database, source: &mut dyn JobSource, page: u32) -> Result<u32> {
    let Some(batch) = source.discover_page(page)? else {
        tracing::info!(page, "listing exhausted, restarting scan");
        return Ok(0);
    };
    let found = batch.len();
    let inserted = with_busy_retry("register_discovered", || db.register_discovered(&batch))?;
    tracing::info!(page, found, inserted, "registered discovered jobs");
    Ok(page + 1)
}

/// Enrich one batch of pending jobs. Returns how many ids were taken
/// off the backlog; zero means the backlog is empty and the caller
/// should idle.
pub fn enrich_once(
    db: &mut Database,
    source: &mut dyn JobSource,
    batch_size: usize,
) -> Result<usize> {
    let pending = db.pending_ids(batch_size)?;
    if pending.is_empty() {
        return Ok(0);
    }
    let results = source.fetch_details(&pending)?;
    let stats = with_busy_retry("apply_enrichment", || db.apply_enrichment(&results))?;
    tracing::info!(
        taken = pending.len(),
        merged = stats.merged,
        errored = stats.errored,
        failed = stats.failed,
        "applied enrichment batch"
    );
    Ok(pending.len())
}

/// Discovery producer: scan listing pages forever, registering every id
/// seen. Safe to run alongside the enrichment consumer; the store's own
/// locking plus the busy retry in each call is the only coordination.
pub fn run_discovery(
    db: &mut Database,
    source: &mut dyn JobSource,
    options: &WorkerOptions,
    shutdown: &Shutdown,
) -> Result<()> {
    let mut page = 0;
    while !shutdown.is_requested() {
        match discover_once(db, source, page) {
            Ok(next_page) => {
                if next_page == 0 {
                    std::thread::sleep(options.poll_interval);
                }
                page = next_page;
            }
            Err(err) => {
                // Retries are already exhausted at this point; report
                // and move on rather than dying mid-scan.
                tracing::error!(page, error = %err, "discovery batch failed");
                std::thread::sleep(options.poll_interval);
            }
        }
    }
    tracing::info!("discovery producer stopped");
    Ok(())
}

/// Enrichment consumer: drain the pending backlog forever. The store
/// does no per-row claiming, so run exactly one of these; a second
/// consumer would fetch the same pending ids.
pub fn run_enrichment(
    db: &mut Database,
    source: &mut dyn JobSource,
    options: &WorkerOptions,
    shutdown: &Shutdown,
) -> Result<()> {
    while !shutdown.is_requested() {
        match enrich_once(db, source, options.batch_size) {
            Ok(0) => std::thread::sleep(options.poll_interval),
            Ok(_) => {}
            Err(err) => {
                tracing::error!(error = %err, "enrichment batch failed");
                std::thread::sleep(options.poll_interval);
            }
        }
    }
    tracing::info!("enrichment consumer stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorMarker, JobDetail, JobFields, JobState};

    /// Scripted source: fixed listing pages, details computed per id.
    struct ScriptedSource {
        pages: Vec<BTreeMap<i64, DiscoveredJob>>,
        failing_ids: Vec<i64>,
    }

    impl JobSource for ScriptedSource {
        fn discover_page(&mut self, page: u32) -> Result<Option<BTreeMap<i64, DiscoveredJob>>> {
            Ok(self.pages.get(page as usize).cloned())
        }

        fn fetch_details(&mut self, job_ids: &[i64]) -> Result<BTreeMap<i64, EnrichmentOutcome>> {
            Ok(job_ids
                .iter()
                .map(|&id| {
                    let outcome = if self.failing_ids.contains(&id) {
                        EnrichmentOutcome::Error(ErrorMarker { error: true })
                    } else {
                        EnrichmentOutcome::Detail(Box::new(JobDetail {
                            jobs: Some(JobFields {
                                description: Some(format!("detail for {id}")),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }))
                    };
                    (id, outcome)
                })
                .collect())
        }
    }

    fn job(title: &str) -> DiscoveredJob {
        DiscoveredJob {
            title: title.to_string(),
            sponsored: false,
        }
    }

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db
    }

    #[test]
    fn test_discovery_pages_then_wraps() {
        let mut db = test_db();
        let mut source = ScriptedSource {
            pages: vec![
                BTreeMap::from([(1, job("a")), (2, job("b"))]),
                BTreeMap::from([(2, job("b")), (3, job("c"))]),
            ],
            failing_ids: vec![],
        };

        let mut page = 0;
        page = discover_once(&mut db, &mut source, page).unwrap();
        assert_eq!(page, 1);
        page = discover_once(&mut db, &mut source, page).unwrap();
        assert_eq!(page, 2);
        // Past the last page the producer wraps around.
        page = discover_once(&mut db, &mut source, page).unwrap();
        assert_eq!(page, 0);

        assert_eq!(db.pending_ids(10).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_enrichment_drains_backlog() {
        let mut db = test_db();
        let mut source = ScriptedSource {
            pages: vec![BTreeMap::from([(1, job("a")), (2, job("b")), (3, job("c"))])],
            failing_ids: vec![2],
        };
        discover_once(&mut db, &mut source, 0).unwrap();

        assert_eq!(enrich_once(&mut db, &mut source, 2).unwrap(), 2);
        assert_eq!(enrich_once(&mut db, &mut source, 2).unwrap(), 1);
        assert_eq!(enrich_once(&mut db, &mut source, 2).unwrap(), 0);

        assert!(matches!(
            db.get_job(1).unwrap().unwrap().state(),
            JobState::Scraped(_)
        ));
        assert_eq!(db.get_job(2).unwrap().unwrap().state(), JobState::Error);
        assert!(matches!(
            db.get_job(3).unwrap().unwrap().state(),
            JobState::Scraped(_)
        ));
        assert_eq!(db.state_counts().unwrap().pending, 0);
    }

    #[test]
    fn test_shutdown_stops_loop_between_batches() {
        let mut db = test_db();
        let mut source = ScriptedSource {
            pages: vec![],
            failing_ids: vec![],
        };
        let shutdown = Shutdown::new();
        shutdown.request();

        let options = WorkerOptions {
            poll_interval: Duration::from_millis(1),
            batch_size: 10,
        };
        run_discovery(&mut db, &mut source, &options, &shutdown).unwrap();
        run_enrichment(&mut db, &mut source, &options, &shutdown).unwrap();
    }
}
