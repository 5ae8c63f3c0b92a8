//! Fixed-size pool of browser workers.
//!
//! A dispatcher task owns the job queue and the idle set. Each job remembers
//! which workers already tried it, so a requeued job lands on a different
//! worker whenever one exists. Workers own their session exclusively and
//! recycle it after `recycle_after` tasks, after a timeout, or after a crash.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use mineassembler_shared::{Coordinates, ProjectId, RawSourceRecord, ScrapeConfig, ScrapeError};

use crate::Scraper;
use crate::extract;
use crate::session::{BrowserSession, MAP_CENTER_SCRIPT, SessionFactory};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Runtime settings for the pool, derived from [`ScrapeConfig`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub page_timeout: Duration,
    pub map_timeout: Duration,
    pub max_requeues: u32,
    pub recycle_after: u32,
    pub politeness: Duration,
    pub base_host: String,
}

impl From<&ScrapeConfig> for PoolSettings {
    fn from(config: &ScrapeConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            page_timeout: Duration::from_secs(config.page_timeout_secs),
            map_timeout: Duration::from_secs(config.map_timeout_secs),
            max_requeues: config.max_requeues,
            recycle_after: config.recycle_after.max(1),
            politeness: Duration::from_millis(config.politeness_ms),
            base_host: config.base_host.trim_end_matches('/').to_string(),
        }
    }
}

impl PoolSettings {
    pub fn profile_url(&self, id: &ProjectId) -> String {
        format!("{}/project-profile?gid={id}", self.base_host)
    }

    pub fn map_url(&self, id: &ProjectId) -> String {
        format!("{}/map?gid={id}", self.base_host)
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Task {
    Profile(ProjectId),
    MapCenter(ProjectId),
}

impl Task {
    fn id(&self) -> &ProjectId {
        match self {
            Task::Profile(id) | Task::MapCenter(id) => id,
        }
    }
}

#[derive(Debug)]
enum Output {
    Record(RawSourceRecord),
    Center(Option<Coordinates>),
}

type Reply = oneshot::Sender<Result<Output, ScrapeError>>;

struct Job {
    task: Task,
    tried: HashSet<usize>,
    requeues: u32,
    reply: Reply,
}

struct Done {
    worker: usize,
    job: Job,
    result: Result<Output, ScrapeError>,
}

// ---------------------------------------------------------------------------
// ScrapePool
// ---------------------------------------------------------------------------

/// Browser-driven scraper backed by `settings.workers` isolated sessions.
pub struct ScrapePool {
    submit: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ScrapePool {
    /// Spawn the dispatcher and workers. Sessions launch lazily on first use.
    pub fn start(factory: Arc<dyn SessionFactory>, settings: PoolSettings) -> Self {
        let settings = Arc::new(settings);
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let mut worker_txs = Vec::with_capacity(settings.workers);
        let mut handles = Vec::with_capacity(settings.workers);
        for worker in 0..settings.workers {
            let (tx, rx) = mpsc::channel(1);
            worker_txs.push(tx);
            handles.push(tokio::spawn(run_worker(
                worker,
                factory.clone(),
                settings.clone(),
                rx,
                done_tx.clone(),
            )));
        }
        drop(done_tx);

        info!(workers = settings.workers, "scrape pool started");

        let dispatcher = Dispatcher {
            queue: VecDeque::new(),
            idle: (0..settings.workers).collect(),
            worker_txs,
            max_requeues: settings.max_requeues,
        };
        let handle = tokio::spawn(dispatcher.run(submit_rx, done_rx, handles));

        Self {
            submit: Mutex::new(Some(submit_tx)),
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    /// Stop accepting work, let queued and in-flight jobs finish, close all sessions.
    pub async fn shutdown(&self) {
        self.submit.lock().await.take();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "scrape dispatcher panicked");
            }
        }
        info!("scrape pool stopped");
    }

    async fn submit(&self, task: Task) -> Result<Output, ScrapeError> {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            task,
            tried: HashSet::new(),
            requeues: 0,
            reply,
        };
        {
            let submit = self.submit.lock().await;
            let sender = submit
                .as_ref()
                .ok_or_else(|| ScrapeError::Crashed("scrape pool is shut down".into()))?;
            sender
                .send(job)
                .map_err(|_| ScrapeError::Crashed("scrape pool is shut down".into()))?;
        }
        rx.await
            .map_err(|_| ScrapeError::Crashed("scrape job dropped".into()))?
    }
}

#[async_trait]
impl Scraper for ScrapePool {
    #[instrument(skip_all, fields(gid = %id))]
    async fn scrape(&self, id: &ProjectId) -> Result<RawSourceRecord, ScrapeError> {
        match self.submit(Task::Profile(id.clone())).await? {
            Output::Record(record) => Ok(record),
            Output::Center(_) => Err(ScrapeError::Crashed("mismatched scrape output".into())),
        }
    }

    #[instrument(skip_all, fields(gid = %id))]
    async fn locate(&self, id: &ProjectId) -> Result<Option<Coordinates>, ScrapeError> {
        match self.submit(Task::MapCenter(id.clone())).await? {
            Output::Center(center) => Ok(center),
            Output::Record(_) => Err(ScrapeError::Crashed("mismatched scrape output".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Dispatcher {
    queue: VecDeque<Job>,
    idle: BTreeSet<usize>,
    worker_txs: Vec<mpsc::Sender<Job>>,
    max_requeues: u32,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut submit_rx: mpsc::UnboundedReceiver<Job>,
        mut done_rx: mpsc::UnboundedReceiver<Done>,
        workers: Vec<JoinHandle<()>>,
    ) {
        let mut accepting = true;
        loop {
            self.assign().await;

            if !accepting && self.queue.is_empty() && self.idle.len() == self.worker_txs.len() {
                break;
            }

            tokio::select! {
                job = submit_rx.recv(), if accepting => match job {
                    Some(job) => self.queue.push_back(job),
                    None => accepting = false,
                },
                Some(done) = done_rx.recv() => self.finish(done),
                else => break,
            }
        }

        // Closing the worker channels ends each worker loop, which closes its session.
        self.worker_txs.clear();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "scrape worker panicked");
            }
        }
    }

    /// Hand queued jobs to idle workers that have not tried them yet.
    async fn assign(&mut self) {
        let total = self.worker_txs.len();
        let mut index = 0;
        while index < self.queue.len() && !self.idle.is_empty() {
            let tried = &self.queue[index].tried;
            let worker = self
                .idle
                .iter()
                .copied()
                .find(|w| !tried.contains(w))
                // Every worker already failed it: any idle one will do.
                .or_else(|| (tried.len() >= total).then(|| self.idle.first().copied()).flatten());

            let Some(worker) = worker else {
                index += 1;
                continue;
            };
            let Some(mut job) = self.queue.remove(index) else {
                break;
            };
            self.idle.remove(&worker);
            job.tried.insert(worker);
            debug!(worker, gid = %job.task.id(), requeues = job.requeues, "dispatching");

            if let Err(mpsc::error::SendError(job)) = self.worker_txs[worker].send(job).await {
                let _ = job
                    .reply
                    .send(Err(ScrapeError::Crashed(format!("worker {worker} is gone"))));
            }
        }
    }

    fn finish(&mut self, done: Done) {
        let Done {
            worker,
            mut job,
            result,
        } = done;
        self.idle.insert(worker);

        match result {
            Err(err) if err.is_requeueable() && job.requeues < self.max_requeues => {
                job.requeues += 1;
                warn!(
                    worker,
                    gid = %job.task.id(),
                    requeue = job.requeues,
                    max_requeues = self.max_requeues,
                    error = %err,
                    "requeueing on another worker"
                );
                self.queue.push_front(job);
            }
            result => {
                if let Err(err) = &result {
                    warn!(worker, gid = %job.task.id(), error = %err, "scrape failed");
                }
                // The caller may have gone away; nothing to do then.
                let _ = job.reply.send(result);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Spacing between consecutive page loads of one worker, measured from the
/// end of the previous load.
struct Politeness {
    gap: Duration,
    last: Option<Instant>,
}

impl Politeness {
    fn new(gap: Duration) -> Self {
        Self { gap, last: None }
    }

    async fn wait(&self) {
        if let Some(previous) = self.last {
            let since = previous.elapsed();
            if since < self.gap {
                tokio::time::sleep(self.gap - since).await;
            }
        }
    }

    fn mark(&mut self) {
        self.last = Some(Instant::now());
    }

    /// Run one page load after the delay, then restart the clock.
    async fn load<T>(
        &mut self,
        limit: Duration,
        fut: impl Future<Output = Result<T, ScrapeError>>,
    ) -> Result<T, ScrapeError> {
        self.wait().await;
        let result = timed(limit, fut).await;
        self.mark();
        result
    }
}

async fn run_worker(
    worker: usize,
    factory: Arc<dyn SessionFactory>,
    settings: Arc<PoolSettings>,
    mut jobs: mpsc::Receiver<Job>,
    done: mpsc::UnboundedSender<Done>,
) {
    let mut session: Option<Box<dyn BrowserSession>> = None;
    let mut served: u32 = 0;
    let mut politeness = Politeness::new(settings.politeness);

    while let Some(job) = jobs.recv().await {
        let result = match session.as_mut() {
            Some(s) => run_task(s.as_mut(), &job.task, &settings, &mut politeness).await,
            None => match factory.launch(worker).await {
                Ok(mut s) => {
                    let result = run_task(s.as_mut(), &job.task, &settings, &mut politeness).await;
                    session = Some(s);
                    result
                }
                Err(e) => Err(e),
            },
        };
        served += 1;

        let broken = matches!(result, Err(ScrapeError::Crashed(_) | ScrapeError::Timeout(_)));
        if broken || served >= settings.recycle_after {
            if let Some(mut s) = session.take() {
                debug!(worker, served, broken, "recycling browser session");
                s.close().await;
            }
            served = 0;
        }

        if done.send(Done { worker, job, result }).is_err() {
            break;
        }
    }

    if let Some(mut s) = session.take() {
        s.close().await;
    }
    debug!(worker, "scrape worker stopped");
}

async fn run_task(
    session: &mut dyn BrowserSession,
    task: &Task,
    settings: &PoolSettings,
    politeness: &mut Politeness,
) -> Result<Output, ScrapeError> {
    match task {
        Task::Profile(id) => {
            let url = settings.profile_url(id);
            let html = politeness
                .load(settings.page_timeout, session.content(&url))
                .await?;
            let mut page = extract::parse_profile(&html, &settings.base_host)?;

            if let Some(company_url) = page.company_url.clone().filter(|_| page.needs_company_table()) {
                match politeness
                    .load(settings.page_timeout, session.content(&company_url))
                    .await
                {
                    Ok(company_html) => {
                        let row = extract::parse_company_table(
                            &company_html,
                            id,
                            page.project_name.as_deref(),
                        );
                        if let Some(row) = row {
                            page.stage = page.stage.or(row.stage);
                            page.commodities = page.commodities.or(row.commodities);
                        }
                    }
                    Err(e) => debug!(gid = %id, error = %e, "company profile unavailable"),
                }
            }

            Ok(Output::Record(page.into_record(id, &url, &settings.base_host)))
        }
        Task::MapCenter(id) => {
            let url = settings.map_url(id);
            let value = politeness
                .load(settings.map_timeout, session.evaluate(&url, MAP_CENTER_SCRIPT))
                .await?;
            Ok(Output::Center(extract::map_center(&value)))
        }
    }
}

/// Bound a page operation; an expired deadline becomes [`ScrapeError::Timeout`].
async fn timed<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, ScrapeError>>,
) -> Result<T, ScrapeError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(ScrapeError::Timeout(limit.as_millis() as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PAGE: &str = r#"<h1>Beta Hill</h1><h3 id="company-name">Beta Corp</h3>
        <a id="company-news-btn" href="/company-profile?gid=88">news</a>
        <table class="properties-wrapper-table">
          <tr><td>Stage</td><td>Exploration</td></tr>
          <tr><td>Commodities</td><td>Gold</td></tr>
        </table>"#;

    /// Profile without a stage row, so the company page is loaded too.
    const SPARSE_PAGE: &str = r#"<h1>Gamma Flats</h1><h3 id="company-name">Gamma Metals</h3>
        <a id="company-news-btn" href="/company-profile?gid=88">news</a>
        <table class="properties-wrapper-table">
          <tr><td>Commodities</td><td>Lithium</td></tr>
        </table>"#;

    #[derive(Clone, Copy, PartialEq, Debug)]
    enum Behaviour {
        Ok,
        Hang,
        Crash,
        Empty,
        Sparse,
    }

    /// Records every page load per worker; worker `n` behaves as `plan[n]`.
    #[derive(Default)]
    struct FakeFactory {
        plan: Vec<Behaviour>,
        visits: Arc<StdMutex<Vec<(usize, String)>>>,
        launches: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    impl FakeFactory {
        fn new(plan: Vec<Behaviour>) -> Self {
            Self {
                plan,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn launch(&self, worker: usize) -> Result<Box<dyn BrowserSession>, ScrapeError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                worker,
                behaviour: self.plan.get(worker).copied().unwrap_or(Behaviour::Ok),
                visits: self.visits.clone(),
                closes: self.closes.clone(),
            }))
        }
    }

    struct FakeSession {
        worker: usize,
        behaviour: Behaviour,
        visits: Arc<StdMutex<Vec<(usize, String)>>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        async fn content(&mut self, url: &str) -> Result<String, ScrapeError> {
            self.visits.lock().unwrap().push((self.worker, url.to_string()));
            match self.behaviour {
                Behaviour::Ok => Ok(PAGE.to_string()),
                Behaviour::Hang => std::future::pending().await,
                Behaviour::Crash => Err(ScrapeError::Crashed("target closed".into())),
                Behaviour::Empty => Ok("<div></div>".to_string()),
                Behaviour::Sparse => Ok(SPARSE_PAGE.to_string()),
            }
        }

        async fn evaluate(&mut self, url: &str, _script: &str) -> Result<Value, ScrapeError> {
            self.visits.lock().unwrap().push((self.worker, url.to_string()));
            match self.behaviour {
                Behaviour::Hang => std::future::pending().await,
                _ => Ok(serde_json::json!({"lat": -19.0, "lng": 131.0})),
            }
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(workers: usize) -> PoolSettings {
        PoolSettings {
            workers,
            page_timeout: Duration::from_secs(45),
            map_timeout: Duration::from_secs(7),
            max_requeues: 2,
            recycle_after: 50,
            politeness: Duration::from_millis(250),
            base_host: "https://mininghub.com".into(),
        }
    }

    fn workers_visited(visits: &StdMutex<Vec<(usize, String)>>) -> Vec<usize> {
        visits.lock().unwrap().iter().map(|(w, _)| *w).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn hung_page_times_out_and_moves_to_another_worker() {
        let factory = Arc::new(FakeFactory::new(vec![Behaviour::Hang, Behaviour::Ok]));
        let pool = ScrapePool::start(factory.clone(), settings(2));

        let record = pool.scrape(&ProjectId::new("1002")).await.unwrap();
        assert_eq!(record.fields.companies[0].company_name, "Beta Corp");

        let visited = workers_visited(&factory.visits);
        // Worker 0 hangs, the retry goes to worker 1; the second load on
        // worker 1 is the company profile page.
        assert_eq!(visited[0], 0);
        assert!(visited[1..].iter().all(|w| *w == 1));
        // The timed-out session was recycled.
        assert!(factory.closes.load(Ordering::SeqCst) >= 1);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_requeues_yield_timeout() {
        let factory = Arc::new(FakeFactory::new(vec![Behaviour::Hang, Behaviour::Hang]));
        let pool = ScrapePool::start(factory.clone(), settings(2));
        let started = Instant::now();

        let err = pool.scrape(&ProjectId::new("1003")).await.unwrap_err();
        assert_eq!(err, ScrapeError::Timeout(45_000));
        // First try plus two requeues, alternating workers.
        assert_eq!(workers_visited(&factory.visits), vec![0, 1, 0]);
        assert!(started.elapsed() >= Duration::from_secs(135));

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn not_rendered_is_not_requeued() {
        let factory = Arc::new(FakeFactory::new(vec![Behaviour::Empty, Behaviour::Ok]));
        let pool = ScrapePool::start(factory.clone(), settings(2));

        let err = pool.scrape(&ProjectId::new("5")).await.unwrap_err();
        assert!(matches!(err, ScrapeError::NotRendered(_)));
        assert_eq!(workers_visited(&factory.visits), vec![0]);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn crash_recycles_session() {
        let factory = Arc::new(FakeFactory::new(vec![Behaviour::Crash]));
        let pool = ScrapePool::start(factory.clone(), settings(1));

        let err = pool.scrape(&ProjectId::new("6")).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Crashed(_)));
        // One worker: each requeue relaunches the session on the same worker.
        assert_eq!(factory.launches.load(Ordering::SeqCst), 3);
        assert_eq!(factory.closes.load(Ordering::SeqCst), 3);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_recycle_after_task_budget() {
        let factory = Arc::new(FakeFactory::new(vec![Behaviour::Ok]));
        let mut s = settings(1);
        s.recycle_after = 2;
        let pool = ScrapePool::start(factory.clone(), s);

        for gid in ["1", "2", "3"] {
            pool.locate(&ProjectId::new(gid)).await.unwrap();
        }
        pool.shutdown().await;

        assert_eq!(factory.launches.load(Ordering::SeqCst), 2);
        // One recycle plus the close on shutdown.
        assert_eq!(factory.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn map_center_uses_short_timeout() {
        let factory = Arc::new(FakeFactory::new(vec![Behaviour::Hang]));
        let mut s = settings(1);
        s.max_requeues = 0;
        let pool = ScrapePool::start(factory, s);

        let err = pool.locate(&ProjectId::new("9")).await.unwrap_err();
        assert_eq!(err, ScrapeError::Timeout(7_000));
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn politeness_delay_between_requests() {
        let factory = Arc::new(FakeFactory::new(vec![Behaviour::Ok]));
        let pool = ScrapePool::start(factory, settings(1));
        let started = Instant::now();

        for gid in ["1", "2", "3"] {
            pool.locate(&ProjectId::new(gid)).await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(500));
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn company_page_load_waits_for_politeness() {
        let factory = Arc::new(FakeFactory::new(vec![Behaviour::Sparse]));
        let pool = ScrapePool::start(factory.clone(), settings(1));
        let started = Instant::now();

        pool.scrape(&ProjectId::new("1002")).await.unwrap();
        let visits: Vec<String> = factory
            .visits
            .lock()
            .unwrap()
            .iter()
            .map(|(_, url)| url.clone())
            .collect();
        assert_eq!(
            visits,
            vec![
                "https://mininghub.com/project-profile?gid=1002".to_string(),
                "https://mininghub.com/company-profile?gid=88".to_string(),
            ]
        );
        assert!(started.elapsed() >= Duration::from_millis(250));

        // The next job's first load also waits after the company page.
        pool.locate(&ProjectId::new("1002")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let pool = ScrapePool::start(Arc::new(FakeFactory::new(vec![])), settings(1));
        pool.shutdown().await;
        assert!(matches!(
            pool.scrape(&ProjectId::new("1")).await,
            Err(ScrapeError::Crashed(_))
        ));
    }
}
