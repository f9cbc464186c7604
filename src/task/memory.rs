//! In-memory task store (non-persistent).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    now_string, select_next_todo, DeployRecord, NewTask, Task, TaskError, TaskId, TaskRepository,
    TaskStatus, TaskUpdate,
};

#[derive(Clone)]
pub struct InMemoryTaskStore {
    max_test_cases: u32,
    /// Creation order.
    tasks: Arc<RwLock<Vec<Task>>>,
    records: Arc<RwLock<Vec<DeployRecord>>>,
}

impl InMemoryTaskStore {
    pub fn new(max_test_cases: u32) -> Self {
        Self {
            max_test_cases,
            tasks: Arc::new(RwLock::new(Vec::new())),
            records: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    fn max_test_cases(&self) -> u32 {
        self.max_test_cases
    }

    async fn create(&self, task: NewTask) -> Result<Task, TaskError> {
        task.validate(self.max_test_cases)?;
        let task = Task::from_new(task, now_string());
        self.tasks.write().await.push(task.clone());
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskError> {
        Ok(self.tasks.read().await.iter().find(|t| t.id == id).cloned())
    }

    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(TaskError::NotFound(id))?;
        task.apply(update, now_string())?;
        Ok(task.clone())
    }

    async fn next_todo(&self) -> Result<Option<Task>, TaskError> {
        let tasks = self.tasks.read().await;
        Ok(select_next_todo(&tasks).cloned())
    }

    async fn all_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, TaskError> {
        Ok(self
            .tasks
            .read()
            .await
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn all(&self) -> Result<Vec<Task>, TaskError> {
        Ok(self.tasks.read().await.clone())
    }

    async fn append_deploy_record(&self, record: DeployRecord) -> Result<(), TaskError> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn deploy_records(&self) -> Result<Vec<DeployRecord>, TaskError> {
        Ok(self.records.read().await.clone())
    }
}
