use tokio::sync::oneshot;

/// A message that includes a channel for the receiver to acknowledge it on, optionally attaching
/// a result.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    message: M,
    acknowledger: oneshot::Sender<R>,
}

impl<M, R> AcknowledgedMessage<M, R> {
    /// Create a new message and return it along with the receiver that gets notified when the
    /// message is acknowledged.
    pub(crate) fn package(message: M) -> (Self, AcknowledgmentReceiver<R>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                message,
                acknowledger: sender,
            },
            AcknowledgmentReceiver { receiver },
        )
    }

    pub(crate) fn into_parts(self) -> (M, AcknowledgmentSender<R>) {
        (
            self.message,
            AcknowledgmentSender {
                sender: self.acknowledger,
            },
        )
    }
}

#[derive(Debug)]
pub(crate) struct AcknowledgmentSender<R> {
    sender: oneshot::Sender<R>,
}

impl<R> AcknowledgmentSender<R> {
    /// Acknowledge the message. The result is discarded if the sender is no longer waiting.
    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        let _: std::result::Result<_, _> = self.sender.send(result.into());
    }
}

#[derive(Debug)]
pub(crate) struct AcknowledgmentReceiver<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> AcknowledgmentReceiver<R> {
    /// Wait for the message to be acknowledged, returning `None` if the acknowledger was dropped
    /// without acknowledging.
    pub(crate) async fn wait_for_acknowledgment(self) -> Option<R> {
        self.receiver.await.ok()
    }
}
