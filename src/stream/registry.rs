use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::jobs::PageDispatcher;
use crate::models::{DEFAULT_RULE_DOMAIN, TrackedPage};
use crate::stream::Task;
use crate::utils::error::{AppError, Result};

pub type TaskBox = Arc<dyn Task>;

/// Host-class name to task. A page goes to the task named after its host when
/// one is registered, otherwise to `default`.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, TaskBox>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, task: TaskBox) {
        let name = task.name().to_string();
        let mut tasks = self.tasks.write().await;
        if tasks.insert(name.clone(), task).is_some() {
            tracing::warn!("task {} registered twice, keeping the latest", name);
        }
    }

    pub async fn has_task(&self, name: &str) -> bool {
        let tasks = self.tasks.read().await;
        tasks.contains_key(name)
    }

    pub async fn task_names(&self) -> Vec<String> {
        let tasks = self.tasks.read().await;
        let mut names: Vec<String> = tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn tasks(&self) -> Vec<TaskBox> {
        let tasks = self.tasks.read().await;
        tasks.values().cloned().collect()
    }

    pub async fn route(&self, page: &TrackedPage) -> Result<TaskBox> {
        let tasks = self.tasks.read().await;
        tasks
            .get(&page.host())
            .or_else(|| tasks.get(DEFAULT_RULE_DOMAIN))
            .cloned()
            .ok_or_else(|| AppError::NotFound {
                resource: format!("task for {}", page.url),
            })
    }
}

#[async_trait]
impl PageDispatcher for TaskRegistry {
    async fn dispatch(&self, page: TrackedPage) -> Result<()> {
        let task = self.route(&page).await?;
        task.publish(&page).await
    }
}
