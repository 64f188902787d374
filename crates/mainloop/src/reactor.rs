//! Running a [`Mainloop`] against the state that owns it.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::mainloop::Mainloop;

/// Pause between batches while deferred steps keep re-queuing themselves.
const BATCH_BACKOFF: Duration = Duration::from_millis(1);

/// State that owns its own [`Mainloop`].
///
/// Jobs receive `&mut Self`, so every piece of shared state is reached from
/// the loop thread only and needs no locking.
pub trait Reactor: Sized {
    /// Message injected from outside the loop.
    type Command;

    /// The loop owned by this state.
    fn mainloop(&mut self) -> &mut Mainloop<Self>;

    /// Handle one message from outside the loop.
    fn handle_command(&mut self, command: Self::Command);

    /// Checked between batches; `true` ends [`run`].
    fn should_stop(&self) -> bool {
        false
    }

    /// Run jobs until none is runnable at the current time.
    ///
    /// A job that unconditionally re-queues itself keeps this from returning.
    fn run_pending(&mut self) -> usize {
        let mut ran = 0usize;
        while let Some(job) = self.mainloop().next_job() {
            job(self);
            ran = ran.saturating_add(1);
        }
        ran
    }

    /// Run the jobs runnable right now, leaving the ones they queue.
    fn run_batch(&mut self) -> usize {
        let batch = self.mainloop().take_batch();
        let ran = batch.len();
        for job in batch {
            job(self);
        }
        ran
    }

    /// Move the clock forward by `by`, firing every timer due on the way in
    /// deadline order and running jobs to idle at each stop.
    fn advance(&mut self, by: Duration) {
        let target = self.mainloop().now().saturating_add(by);
        self.run_pending();
        while let Some(deadline) = self.mainloop().next_deadline() {
            if deadline > target {
                break;
            }
            self.mainloop().set_now(deadline);
            self.run_pending();
        }
        self.mainloop().set_now(target);
        self.run_pending();
    }
}

/// Drive a reactor in real time until the command channel closes or the
/// reactor asks to stop.
///
/// The loop clock follows [`tokio::time::Instant`], so paused-time tests
/// drive it the same way production does.
pub async fn run<R: Reactor>(reactor: &mut R, commands: &mut mpsc::UnboundedReceiver<R::Command>) {
    let origin = Instant::now();
    let base = reactor.mainloop().now();
    info!("mainloop running");

    loop {
        reactor.mainloop().set_now(base.saturating_add(origin.elapsed()));

        loop {
            match commands.try_recv() {
                Ok(command) => reactor.handle_command(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("command channel closed, mainloop exiting");
                    return;
                }
            }
        }

        let ran = reactor.run_batch();
        if reactor.should_stop() {
            info!("mainloop stopped");
            return;
        }

        let now = base.saturating_add(origin.elapsed());
        reactor.mainloop().set_now(now);
        let wait = if reactor.mainloop().has_ready_work() {
            Some(BATCH_BACKOFF)
        } else {
            reactor
                .mainloop()
                .next_deadline()
                .map(|deadline| deadline.saturating_sub(now))
        };
        debug!(ran, ?wait, "mainloop idle");

        let sleep = async {
            match wait {
                Some(wait) => tokio::time::sleep(wait).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => reactor.handle_command(command),
                None => {
                    info!("command channel closed, mainloop exiting");
                    return;
                }
            },
            () = sleep => {}
        }
    }
}
