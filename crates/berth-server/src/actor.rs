use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use log::error;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};

const ACTOR_CHANNEL_SIZE: usize = 64;

#[tonic::async_trait]
pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;
    type Options: Send + 'static;

    fn name() -> &'static str;
    fn new(options: Self::Options) -> Self;
    /// Called once before the actor starts receiving messages.
    async fn start(&mut self, ctx: &mut ActorContext<Self>);
    /// Process one message and return the next action.
    /// All messages are processed sequentially in a single task, so this
    /// method must not block. If the actor needs to perform async operations,
    /// it should spawn tasks via [`ActorContext::spawn`] and have the tasks
    /// send the outcome back as messages.
    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: Self::Message) -> ActorAction;
    async fn stop(self, ctx: &mut ActorContext<Self>);
}

pub enum ActorAction {
    Continue,
    Stop,
}

/// A collection of actors that can be awaited together.
pub struct ActorSystem {
    actors: Vec<watch::Receiver<bool>>,
}

impl Default for ActorSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorSystem {
    pub fn new() -> Self {
        Self { actors: vec![] }
    }

    pub fn spawn<T: Actor>(&mut self, options: T::Options) -> ActorHandle<T> {
        let handle = ActorHandle::new(options);
        self.actors.push(handle.stopped.clone());
        handle
    }

    /// Wait for all actors spawned in this system to stop.
    pub async fn join(&mut self) {
        for mut stopped in self.actors.drain(..) {
            let _ = stopped.wait_for(|x| *x).await;
        }
    }
}

pub struct ActorContext<T: Actor> {
    handle: ActorHandle<T>,
    /// Messages the actor sent to itself. These are processed before messages
    /// from the channel, so a message sent during `receive` is handled right
    /// after the current one, in a separate stack.
    queue: VecDeque<T::Message>,
    /// A set of tasks spawned by the actor when processing messages.
    /// All these tasks will be aborted when the context is dropped.
    tasks: JoinSet<()>,
}

impl<T: Actor> ActorContext<T> {
    fn new(handle: &ActorHandle<T>) -> Self {
        Self {
            handle: handle.clone(),
            queue: VecDeque::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn handle(&self) -> &ActorHandle<T> {
        &self.handle
    }

    /// Send a message to the actor itself, to be processed after the current
    /// message returns.
    pub fn send(&mut self, message: T::Message) {
        self.queue.push_back(message);
    }

    /// Send a message to the actor itself after a delay.
    /// The timer holds only the message, not any actor state; whether the
    /// message is still relevant is decided when it is processed.
    pub fn send_with_delay(&mut self, message: T::Message, delay: Duration) {
        let handle = self.handle.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = handle.send(message).await;
        });
    }

    /// Spawn a task and save the handle in the context.
    pub fn spawn(&mut self, task: impl Future<Output = ()> + Send + 'static) -> AbortHandle {
        self.tasks.spawn(task)
    }

    /// Join tasks that have completed and log panics.
    /// When the actor expects to handle task failures, the logic belongs
    /// inside the task (e.g. sending a message to the actor on error).
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("failed to join task spawned by actor {}: {e}", T::name());
                }
            }
        }
    }
}

pub struct ActorHandle<T: Actor> {
    sender: mpsc::Sender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T: Actor> Clone for ActorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    pub fn new(options: T::Options) -> Self {
        let (tx, rx) = mpsc::channel(ACTOR_CHANNEL_SIZE);
        let (stopped_tx, stopped_rx) = watch::channel::<bool>(false);
        let handle = Self {
            sender: tx,
            stopped: stopped_rx,
        };
        let runner = ActorRunner {
            actor: T::new(options),
            ctx: ActorContext::new(&handle),
            receiver: rx,
            stopped: stopped_tx,
        };
        // The actor runs detached. The event loop task stops by itself when
        // the stop action is taken or all handles are dropped.
        tokio::spawn(runner.run());
        handle
    }

    pub async fn send(&self, message: T::Message) -> Result<(), mpsc::error::SendError<T::Message>> {
        self.sender.send(message).await
    }

    pub async fn wait_for_stop(mut self) {
        // We ignore the receiver error since the sender must have been dropped
        // in this case, which means the actor has stopped.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}

struct ActorRunner<T: Actor> {
    actor: T,
    ctx: ActorContext<T>,
    receiver: mpsc::Receiver<T::Message>,
    stopped: watch::Sender<bool>,
}

impl<T: Actor> ActorRunner<T> {
    async fn run(mut self) {
        self.actor.start(&mut self.ctx).await;
        loop {
            let message = match self.ctx.queue.pop_front() {
                Some(x) => x,
                None => match self.receiver.recv().await {
                    Some(x) => x,
                    None => break,
                },
            };
            match self.actor.receive(&mut self.ctx, message) {
                ActorAction::Continue => {}
                ActorAction::Stop => break,
            }
            self.ctx.reap();
        }
        self.actor.stop(&mut self.ctx).await;
        let _ = self.stopped.send(true);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    struct TestActor {
        delayed: Vec<String>,
    }

    enum TestMessage {
        Echo {
            value: String,
            reply: oneshot::Sender<String>,
        },
        EchoLater {
            value: String,
            delay: Duration,
        },
        Delayed {
            value: String,
        },
        Collect {
            reply: oneshot::Sender<Vec<String>>,
        },
        Stop,
    }

    #[tonic::async_trait]
    impl Actor for TestActor {
        type Message = TestMessage;
        type Options = ();

        fn name() -> &'static str {
            "TestActor"
        }

        fn new(_options: Self::Options) -> Self {
            Self { delayed: vec![] }
        }

        async fn start(&mut self, _: &mut ActorContext<Self>) {}

        fn receive(&mut self, ctx: &mut ActorContext<Self>, message: Self::Message) -> ActorAction {
            match message {
                TestMessage::Echo { value, reply } => {
                    let _ = reply.send(value.to_uppercase());
                    ActorAction::Continue
                }
                TestMessage::EchoLater { value, delay } => {
                    ctx.send_with_delay(TestMessage::Delayed { value }, delay);
                    ActorAction::Continue
                }
                TestMessage::Delayed { value } => {
                    self.delayed.push(value);
                    ActorAction::Continue
                }
                TestMessage::Collect { reply } => {
                    let _ = reply.send(self.delayed.clone());
                    ActorAction::Continue
                }
                TestMessage::Stop => ActorAction::Stop,
            }
        }

        async fn stop(self, _: &mut ActorContext<Self>) {}
    }

    #[tokio::test]
    async fn test_actor_handle_send() {
        let mut system = ActorSystem::new();
        let handle = system.spawn::<TestActor>(());
        let (tx, rx) = oneshot::channel();
        let result = handle
            .send(TestMessage::Echo {
                value: "hello".to_string(),
                reply: tx,
            })
            .await;
        assert!(matches!(result, Ok(())));
        assert_eq!(rx.await, Ok("HELLO".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_send_with_delay() {
        let mut system = ActorSystem::new();
        let handle = system.spawn::<TestActor>(());
        let result = handle
            .send(TestMessage::EchoLater {
                value: "later".to_string(),
                delay: Duration::from_secs(5),
            })
            .await;
        assert!(matches!(result, Ok(())));

        tokio::time::advance(Duration::from_secs(6)).await;
        let (tx, rx) = oneshot::channel();
        let result = handle.send(TestMessage::Collect { reply: tx }).await;
        assert!(matches!(result, Ok(())));
        assert_eq!(rx.await, Ok(vec!["later".to_string()]));
    }

    #[tokio::test]
    async fn test_actor_wait_for_stop() {
        let mut system = ActorSystem::new();
        let handle = system.spawn::<TestActor>(());
        let result = handle.send(TestMessage::Stop).await;
        assert!(matches!(result, Ok(())));

        handle.clone().wait_for_stop().await;
        // Multiple handles should be able to wait for the actor to stop.
        handle.wait_for_stop().await;
        system.join().await;
    }
}
