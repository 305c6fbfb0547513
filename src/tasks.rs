use futures::future::join_all;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[async_trait::async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;
    /// Delay between runs. `None` stops the loop.
    fn schedule(&self) -> Option<Duration>;
    async fn execute(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn box_clone(&self) -> Box<dyn Task>;
}

#[derive(Default)]
pub struct TaskManager {
    tasks: Mutex<Vec<Box<dyn Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_task(&self, task: impl Task + 'static) {
        self.tasks.lock().await.push(Box::new(task));
    }

    pub async fn start_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        let mut handles = self.handles.lock().await;

        for mut task in tasks.drain(..) {
            info!("Starting task {}", task.name());
            let handle = tokio::spawn(async move {
                while let Some(interval) = task.schedule() {
                    let result = task.execute().await;
                    if let Err(e) = result {
                        warn!("Task {} failed: {}", task.name(), e);
                    }
                    tokio::time::sleep(interval).await;
                }
            });
            handles.push(handle);
        }
    }

    pub async fn running(&self) -> usize {
        self.handles
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    pub async fn shutdown(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.iter_mut() {
            handle.abort();
        }
        join_all(handles.iter_mut()).await;
        handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Clone)]
    struct Counter {
        runs: Arc<AtomicUsize>,
        limit: usize,
    }

    #[async_trait::async_trait]
    impl Task for Counter {
        fn name(&self) -> &str {
            "Counter"
        }

        fn schedule(&self) -> Option<Duration> {
            (self.runs.load(Ordering::SeqCst) < self.limit).then_some(Duration::from_millis(5))
        }

        async fn execute(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err("first run fails".into());
            }
            Ok(())
        }

        fn box_clone(&self) -> Box<dyn Task> {
            Box::new(self.clone())
        }
    }

    #[tokio::test]
    async fn tasks_loop_until_unscheduled_and_survive_errors() {
        let runs = Arc::new(AtomicUsize::new(0));
        let manager = TaskManager::new();
        manager
            .add_task(Counter {
                runs: runs.clone(),
                limit: 3,
            })
            .await;
        manager.start_tasks().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(manager.running().await, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_aborts_running_tasks() {
        let runs = Arc::new(AtomicUsize::new(0));
        let manager = TaskManager::new();
        manager
            .add_task(Counter {
                runs: runs.clone(),
                limit: usize::MAX,
            })
            .await;
        manager.start_tasks().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.running().await, 1);

        manager.shutdown().await;
        let seen = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
        assert_eq!(manager.running().await, 0);
    }
}
