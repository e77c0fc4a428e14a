//! In-process messaging fabric.
//!
//! Modules exchange length-one envelopes over unbounded channels addressed
//! by channel id, mirroring how the machines of a deployment address each
//! other's module sockets. Wire framing and cross-machine delivery are the
//! transport layer's job; the broker here only routes to local channels.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{error, warn};

use meridian_sched::sched::{BatchId, MachineId, SlotId, Transaction, TxnId};

pub type Channel = u32;

pub const SERVER_CHANNEL: Channel = 0;
pub const FORWARDER_CHANNEL: Channel = 1;
pub const SEQUENCER_CHANNEL: Channel = 2;
pub const BATCHER_CHANNEL: Channel = 3;
pub const SCHEDULER_CHANNEL: Channel = 4;
pub const WORKER_CHANNEL: Channel = 5;
/// First channel id reserved for broker threads; one id per configured
/// broker port.
pub const BROKER_CHANNEL: Channel = 6;
pub const MAX_CHANNEL: Channel = 14;

/// A numbered batch of transactions cut by the batcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub transactions: Vec<Transaction>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    ForwardTxn {
        txn: Transaction,
    },
    /// A batch together with the log slot the ordering layer granted it.
    ForwardBatch {
        slot: SlotId,
        batch: Batch,
    },
    Ping {
        src_send_time: i64,
        dst: MachineId,
    },
    /// Wake-up nudge with no payload.
    Signal,
    Stats {
        level: u32,
    },
    /// Dispatch of a ready transaction to the worker.
    RunTxn {
        txn: Transaction,
    },
    /// Worker completion notice back to the scheduler.
    TxnFinished {
        txn_id: TxnId,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Pong {
        src_send_time: i64,
        dev: i64,
        dst: MachineId,
    },
    Stats {
        from_channel: Channel,
        stats: serde_json::Value,
    },
    /// Completed transaction on its way back to the coordinating server.
    TxnResult {
        txn: Transaction,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub from: MachineId,
    pub message: Message,
}

impl Envelope {
    pub fn request(from: MachineId, request: Request) -> Self {
        Self {
            from,
            message: Message::Request(request),
        }
    }

    pub fn response(from: MachineId, response: Response) -> Self {
        Self {
            from,
            message: Message::Response(response),
        }
    }
}

/// Channel registry for one machine. Channels are registered once at node
/// setup; afterwards the broker is shared read-only.
pub struct Broker {
    local_machine_id: MachineId,
    channels: HashMap<Channel, UnboundedSender<Envelope>>,
}

impl Broker {
    pub fn new(local_machine_id: MachineId) -> Self {
        Self {
            local_machine_id,
            channels: HashMap::new(),
        }
    }

    pub fn local_machine_id(&self) -> MachineId {
        self.local_machine_id
    }

    /// Register a channel and hand back its receiving end.
    pub fn add_channel(&mut self, channel: Channel) -> UnboundedReceiver<Envelope> {
        let (tx, rx) = unbounded_channel();
        if self.channels.insert(channel, tx).is_some() {
            panic!("channel {channel} is already registered");
        }
        rx
    }

    pub fn sender(&self, channel: Channel) -> Option<UnboundedSender<Envelope>> {
        self.channels.get(&channel).cloned()
    }

    /// Deliver to a local channel. An unknown channel or a closed receiver
    /// drops the envelope.
    pub fn send_to(&self, channel: Channel, envelope: Envelope) {
        match self.channels.get(&channel) {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    warn!("channel {channel} receiver is gone; envelope dropped");
                }
            }
            None => error!("unknown channel {channel}; envelope dropped"),
        }
    }

    /// Deliver to a channel of another machine. Only the local machine is
    /// reachable without the network transport.
    pub fn send_to_machine(&self, machine_id: MachineId, channel: Channel, envelope: Envelope) {
        if machine_id == self.local_machine_id {
            self.send_to(channel, envelope);
        } else {
            warn!("machine {machine_id} is only reachable through the network transport; envelope dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_routes_to_registered_channels() {
        let mut broker = Broker::new(0);
        let mut rx = broker.add_channel(SEQUENCER_CHANNEL);
        broker.send_to(SEQUENCER_CHANNEL, Envelope::request(0, Request::Signal));
        let env = rx.try_recv().unwrap();
        assert!(matches!(env.message, Message::Request(Request::Signal)));
        // Unknown channels drop rather than fail.
        broker.send_to(WORKER_CHANNEL, Envelope::request(0, Request::Signal));
    }

    #[test]
    fn remote_machines_are_not_reachable_in_process() {
        let mut broker = Broker::new(3);
        let mut rx = broker.add_channel(FORWARDER_CHANNEL);
        broker.send_to_machine(1, FORWARDER_CHANNEL, Envelope::request(3, Request::Signal));
        assert!(rx.try_recv().is_err());
        broker.send_to_machine(3, FORWARDER_CHANNEL, Envelope::request(3, Request::Signal));
        assert!(rx.try_recv().is_ok());
    }
}
