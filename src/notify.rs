//! Table-level change signals.
//!
//! Every store publishes the table it touched after its write commits.
//! Signals carry no payload: subscribers re-query. Writers never wait on
//! subscribers; a subscriber that falls behind sees the backlog collapse
//! into a single change.

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

/// Channel capacity for change signals.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Cards,
    Orders,
    OrderCards,
    Listings,
    ListingCards,
    Settings,
    AutocompletePlayers,
    AutocompleteSets,
    AutocompleteParallels,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Cards,
        Table::Orders,
        Table::OrderCards,
        Table::Listings,
        Table::ListingCards,
        Table::Settings,
        Table::AutocompletePlayers,
        Table::AutocompleteSets,
        Table::AutocompleteParallels,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Cards => "cards",
            Table::Orders => "orders",
            Table::OrderCards => "order_cards",
            Table::Listings => "listings",
            Table::ListingCards => "listing_cards",
            Table::Settings => "settings",
            Table::AutocompletePlayers => "autocomplete_players",
            Table::AutocompleteSets => "autocomplete_sets",
            Table::AutocompleteParallels => "autocomplete_parallels",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<Table>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn notify(&self, table: Table) {
        // No receivers is fine: nobody is observing that table.
        let _ = self.tx.send(table);
        tracing::trace!(target: "cardkeep", event = "table_changed", table = table.name());
    }

    pub fn notify_all(&self, tables: &[Table]) {
        for table in tables {
            self.notify(*table);
        }
    }

    /// Subscribe to changes on any of `tables`.
    pub fn subscribe(&self, tables: &[Table]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            tables: tables.to_vec(),
        }
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Filtered view of the bus for a fixed set of tables.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Table>,
    tables: Vec<Table>,
}

impl Subscription {
    /// Resolves once any watched table has changed. Returns `None` when the
    /// bus has been dropped.
    pub async fn changed(&mut self) -> Option<()> {
        loop {
            match self.rx.recv().await {
                Ok(table) if self.tables.contains(&table) => return Some(()),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        target: "cardkeep",
                        event = "subscription_lagged",
                        skipped
                    );
                    return Some(());
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Consume signals that are already queued, returning how many of them
    /// concerned watched tables.
    pub fn drain(&mut self) -> usize {
        let mut relevant = 0;
        loop {
            match self.rx.try_recv() {
                Ok(table) if self.tables.contains(&table) => relevant += 1,
                Ok(_) => {}
                Err(TryRecvError::Lagged(_)) => relevant += 1,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return relevant,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn subscription_filters_other_tables() {
        let bus = ChangeBus::new();
        let mut sub = bus.subscribe(&[Table::Orders]);
        bus.notify(Table::Settings);
        bus.notify(Table::Orders);
        assert_eq!(sub.changed().await, Some(()));
        assert_eq!(sub.drain(), 0);
    }

    #[tokio::test]
    async fn unrelated_change_does_not_wake() {
        let bus = ChangeBus::new();
        let mut sub = bus.subscribe(&[Table::Cards]);
        bus.notify(Table::Listings);
        let woke = tokio::time::timeout(Duration::from_millis(50), sub.changed()).await;
        assert!(woke.is_err());
    }

    #[tokio::test]
    async fn lagging_subscriber_sees_a_single_change() {
        let bus = ChangeBus::new();
        let mut sub = bus.subscribe(&[Table::Cards]);
        for _ in 0..(CHANNEL_CAPACITY * 2) {
            bus.notify(Table::Cards);
        }
        assert_eq!(sub.changed().await, Some(()));
        assert!(sub.drain() > 0);
    }

    #[tokio::test]
    async fn dropped_bus_closes_subscription() {
        let bus = ChangeBus::new();
        let mut sub = bus.subscribe(&Table::ALL);
        drop(bus);
        assert_eq!(sub.changed().await, None);
    }
}
