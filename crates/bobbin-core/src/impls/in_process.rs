//! InProcessLauncher - Actor を同じプロセス内の tokio task として起動する
//!
//! OS プロセスを増やさずに動かしたいとき（テスト・小規模バッチ）用。
//! `id()` は pid ではなく 1 から始まる連番。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::app::{Actor, ActorReport, PollSettings, Services};
use crate::domain::{ActorError, LaunchError};
use crate::machine::MachineRegistry;
use crate::ports::{ActorLauncher, ActorProcess, LaunchArgs};

pub struct InProcessLauncher {
    registry: Arc<MachineRegistry>,
    services: Services,
    poll: PollSettings,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU32,
}

impl InProcessLauncher {
    pub fn new(registry: Arc<MachineRegistry>, services: Services, poll: PollSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            services,
            poll,
            shutdown,
            next_id: AtomicU32::new(1),
        }
    }

    /// 起動済みの全 Actor に停止を要求する
    pub fn cancel_all(&self) {
        // send_replace never fails, even with no receivers left
        self.shutdown.send_replace(true);
    }
}

#[async_trait]
impl ActorLauncher for InProcessLauncher {
    async fn launch(&self, args: &LaunchArgs) -> Result<Box<dyn ActorProcess>, LaunchError> {
        let binding = self
            .registry
            .get(&args.item_type)
            .ok_or_else(|| LaunchError::UnknownItemType(args.item_type.clone()))?
            .clone();
        if !args.extra.is_empty() {
            debug!(item_type = %args.item_type, extra = ?args.extra, "extra launch args are ignored in-process");
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut actor = Actor::new(binding, self.services.clone(), self.poll);
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let result = actor.run(shutdown).await;
            if let Err(e) = &result {
                warn!(task_id = id, error = %e, "in-process actor stopped");
            }
            result
        });
        debug!(item_type = %args.item_type, task_id = id, "spawned in-process actor");
        Ok(Box::new(InProcessActor { id, handle }))
    }
}

pub struct InProcessActor {
    id: u32,
    handle: JoinHandle<Result<ActorReport, ActorError>>,
}

impl ActorProcess for InProcessActor {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_running(&mut self) -> bool {
        !self.handle.is_finished()
    }
}
