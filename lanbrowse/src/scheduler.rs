use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Query,
    Sweep,
    /// The earliest pending resolve window has closed
    ResolveDeadline,
}

/// Session timers: browse re-query, TTL sweep and the nearest resolve deadline
pub struct Schedule {
    /// None in passive mode
    query: Option<Interval>,
    sweep: Interval,
}

impl Schedule {
    /// The first query fires immediately; the first sweep one period later.
    /// Without a query period the session only listens.
    pub fn new(query_period: Option<Duration>, sweep_period: Duration) -> Self {
        let query = query_period.map(|period| {
            let mut query = time::interval(period);
            query.set_missed_tick_behavior(MissedTickBehavior::Delay);
            query
        });

        let mut sweep = time::interval_at(Instant::now() + sweep_period, sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { query, sweep }
    }

    /// Waits for whichever timer is due first. Cancel-safe.
    pub async fn next(&mut self, resolve_deadline: Option<Instant>) -> Tick {
        let Self { query, sweep } = self;
        let query = async {
            match query {
                Some(query) => query.tick().await,
                None => std::future::pending().await,
            }
        };
        let resolve = async {
            match resolve_deadline {
                Some(deadline) => time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = query => Tick::Query,
            _ = sweep.tick() => Tick::Sweep,
            _ = resolve => Tick::ResolveDeadline,
        }
    }
}
