// supervisor.rs

use std::future::Future;

use anyhow::bail;
use log::*;
use tokio::task::JoinSet;

/// Owns the long-lived tasks of the node.
///
/// None of them is supposed to finish. The first one that does, by
/// returning or by panicking, takes the whole node down so the service
/// manager can restart it. Tasks are spawned on the current `LocalSet`.
pub struct Supervisor {
    tasks: JoinSet<(&'static str, anyhow::Result<()>)>,
    names: Vec<&'static str>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            names: Vec::new(),
        }
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + 'static,
    {
        info!("Starting task {name}");
        self.names.push(name);
        self.tasks.spawn_local(async move { (name, task.await) });
    }

    /// Wait for the first task to end, then abort the rest.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let outcome = match self.tasks.join_next().await {
            None => bail!("no tasks to supervise"),
            Some(Ok((name, Ok(())))) => format!("{name}() ended."),
            Some(Ok((name, Err(e)))) => format!("{name}() failed: {e:#}"),
            Some(Err(e)) if e.is_panic() => format!("task panicked: {e}"),
            Some(Err(e)) => format!("task cancelled: {e}"),
        };
        error!("{outcome}");
        self.tasks.shutdown().await;
        info!("Stopped {} tasks: {}", self.names.len(), self.names.join(", "));
        bail!("{outcome}")
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, rc::Rc};
    use tokio::{
        task::LocalSet,
        time::{sleep, Duration},
    };

    async fn forever(alive: Rc<Cell<u32>>) -> anyhow::Result<()> {
        loop {
            alive.set(alive.get() + 1);
            sleep(Duration::from_millis(1)).await;
        }
    }

    async fn short() -> anyhow::Result<()> {
        sleep(Duration::from_millis(20)).await;
        bail!("boom")
    }

    async fn panics() -> anyhow::Result<()> {
        panic!("sensor bus locked up")
    }

    #[tokio::test]
    async fn first_exit_stops_the_rest() {
        let alive = Rc::new(Cell::new(0u32));
        let err = LocalSet::new()
            .run_until(async {
                let mut sup = Supervisor::new();
                sup.spawn("forever", forever(alive.clone()));
                sup.spawn("short", short());
                sup.run().await.unwrap_err()
            })
            .await;
        assert!(err.to_string().contains("short() failed: boom"));
        let seen = alive.get();
        assert!(seen > 0);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(alive.get(), seen);
    }

    #[tokio::test]
    async fn panics_are_reported() {
        let err = LocalSet::new()
            .run_until(async {
                let mut sup = Supervisor::new();
                sup.spawn("bad", panics());
                sup.run().await.unwrap_err()
            })
            .await;
        assert!(err.to_string().contains("panicked"));
    }
}

// EOF
