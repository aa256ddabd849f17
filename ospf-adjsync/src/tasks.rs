//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{Instrument, debug_span};

use crate::task::TimeoutTask;

//
// Instance tasks diagram:
//
//                                    +--------------+
//                     net_rx (1x) -> |              | -> (1x) net_tx
//                                    |              |
//                hello_timer (Nx) -> |              |
//       nsm_inactivity_timer (Nx) -> |              |
//             nsm_poll_timer (Nx) -> |              |
//          dbdesc_rxmt_timer (Nx) -> |   instance   | -> (1x) observer
//           lsreq_rxmt_timer (Nx) -> |              |
//           lsupd_rxmt_timer (Nx) -> |              |
//          dbdesc_free_timer (Nx) -> |              |
// lsdb_maxage_sweep_interval (1x) -> |              |
//                                    +--------------+
//                                          ^
//                                          |
//                                  ctl_rx (1x)
//

// Timer scheduling collaborator.
//
// Timers are one-shot. Once a timer expires, its key is delivered back to the
// instance (see `Instance::process_timer`). Starting an already running timer
// restarts it, and clearing an inactive timer is a no-op.
pub trait TimerService: Send + Sync {
    fn start_timer(&self, key: TimerKey, timeout: Duration);

    fn clear_timer(&self, key: &TimerKey);

    // Checks whether a delivered expiry still belongs to the armed timer,
    // retiring the timer if so. Expiries of timers that were restarted or
    // cleared after firing are stale.
    fn expire(&self, expiry: &TimerExpiry) -> bool {
        let _ = expiry;
        true
    }
}

// Timer identifier.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum TimerKey {
    Interface {
        ifname: String,
        timer: InterfaceTimer,
    },
    Neighbor {
        ifname: String,
        addr: Ipv4Addr,
        timer: NeighborTimer,
    },
    LsdbMaxAgeSweep,
}

// Timer expiry notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TimerExpiry {
    pub key: TimerKey,
    // Arming sequence number of the timer that expired.
    pub generation: u64,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum InterfaceTimer {
    Hello,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum NeighborTimer {
    Inactivity,
    Poll,
    DbDescRxmt,
    LsRequestRxmt,
    LsUpdateRxmt,
    DbDescFree,
}

// Timer service backed by tokio tasks.
//
// Each armed timer is a separate task that sends a `TimerExpiry` through the
// provided channel once it expires. The timer stays registered until the
// expiry is claimed through `expire`, restarted or cleared.
#[derive(Debug)]
pub struct TimerTasks {
    timers: Mutex<ArmedTimers>,
    timer_tx: UnboundedSender<TimerExpiry>,
    time_scale: f64,
}

#[derive(Debug, Default)]
struct ArmedTimers {
    tasks: HashMap<TimerKey, ArmedTimer>,
    next_generation: u64,
}

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    _task: TimeoutTask,
}

// ===== impl TimerTasks =====

impl TimerTasks {
    pub fn new(timer_tx: UnboundedSender<TimerExpiry>) -> TimerTasks {
        TimerTasks {
            timers: Default::default(),
            timer_tx,
            time_scale: 1.0,
        }
    }

    // Scales all timer durations by the given factor.
    pub fn with_time_scale(mut self, time_scale: f64) -> TimerTasks {
        self.time_scale = time_scale;
        self
    }
}

impl TimerService for TimerTasks {
    fn start_timer(&self, key: TimerKey, timeout: Duration) {
        let timeout = timeout.mul_f64(self.time_scale);
        let mut timers = self.timers.lock().unwrap();
        let generation = timers.next_generation;
        timers.next_generation += 1;

        let timer_tx = self.timer_tx.clone();
        let span = debug_span!("timer", ?key);
        let expiry = TimerExpiry {
            key: key.clone(),
            generation,
        };
        let task = TimeoutTask::new(timeout, move || {
            async move {
                let _ = timer_tx.send(expiry);
            }
            .instrument(span)
        });

        // Replacing an existing entry cancels the old task.
        let timer = ArmedTimer {
            generation,
            _task: task,
        };
        timers.tasks.insert(key, timer);
    }

    fn clear_timer(&self, key: &TimerKey) {
        self.timers.lock().unwrap().tasks.remove(key);
    }

    fn expire(&self, expiry: &TimerExpiry) -> bool {
        let mut timers = self.timers.lock().unwrap();
        match timers.tasks.get(&expiry.key) {
            Some(timer) if timer.generation == expiry.generation => {
                timers.tasks.remove(&expiry.key);
                true
            }
            _ => false,
        }
    }
}

// ===== blanket implementations =====

impl<T> TimerService for Arc<T>
where
    T: TimerService + ?Sized,
{
    fn start_timer(&self, key: TimerKey, timeout: Duration) {
        (**self).start_timer(key, timeout)
    }

    fn clear_timer(&self, key: &TimerKey) {
        (**self).clear_timer(key)
    }

    fn expire(&self, expiry: &TimerExpiry) -> bool {
        (**self).expire(expiry)
    }
}
