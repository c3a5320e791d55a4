use tokio::sync::oneshot;

/// The gRPC server stops once the replica drops its handle.
pub(crate) fn shutdown_signal() -> (RpcServerShutdownHandle, RpcServerShutdownSignal) {
    let (tx, rx) = oneshot::channel();
    (RpcServerShutdownHandle { _tx: tx }, RpcServerShutdownSignal { rx })
}

pub(crate) struct RpcServerShutdownHandle {
    _tx: oneshot::Sender<()>,
}

pub(crate) struct RpcServerShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl RpcServerShutdownSignal {
    /// Resolves when the handle is dropped.
    pub(crate) async fn dropped(self) {
        // Nothing is ever sent, so this is always a RecvError.
        let _ = self.rx.await;
    }
}
