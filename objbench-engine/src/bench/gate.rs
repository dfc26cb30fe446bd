use tokio::sync::watch;

/// Holds workers back until all of them can start at once.
#[derive(Debug)]
pub struct StartGate(watch::Sender<bool>);

/// Waiting side of a [`StartGate`].
#[derive(Clone, Debug)]
pub struct StartSignal(watch::Receiver<bool>);

impl StartGate {
    /// Creates a closed gate.
    pub fn new() -> (Self, StartSignal) {
        let (sender, receiver) = watch::channel(false);
        (Self(sender), StartSignal(receiver))
    }

    /// Opens the gate for all current and future waiters.
    pub fn release(self) {
        self.0.send_replace(true);
    }
}

impl StartSignal {
    /// A signal that is already released.
    pub fn released() -> Self {
        let (gate, signal) = StartGate::new();
        gate.release();
        signal
    }

    /// Waits until the gate opens.
    ///
    /// A gate that is dropped without being released counts as opened.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|released| *released).await;
    }
}
