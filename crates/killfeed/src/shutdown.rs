use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    /// First ctrl-c: drain in-flight jobs, then exit.
    Graceful,
    /// Second ctrl-c: exit now.
    Immediate,
}

/// Listen for ctrl-c. The first press asks for a graceful drain, the second
/// forces an immediate exit.
pub fn listen() -> mpsc::UnboundedReceiver<ShutdownSignal> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut presses: u8 = 0;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            presses = presses.saturating_add(1);
            let signal = if presses == 1 {
                ShutdownSignal::Graceful
            } else {
                ShutdownSignal::Immediate
            };
            if tx.send(signal).is_err() || presses > 1 {
                return;
            }
        }
    });
    rx
}
