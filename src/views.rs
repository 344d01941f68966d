//! Live joined views.
//!
//! A view subscribes to the tables it reads, recomputes its whole snapshot
//! inside one read transaction whenever any of them changes, and publishes
//! the result on a watch channel. Bursts of change signals collapse into
//! at most one pending recomputation.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, Stream};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cards::{self, Card};
use crate::listings::{self, ListingWithCards};
use crate::notify::{ChangeBus, Table};
use crate::orders::{self, OrderWithCards};
use crate::{db, AppResult};

pub type Snapshot<T> = Arc<Vec<T>>;

type Loader<T> = for<'c> fn(&'c mut SqliteConnection) -> BoxFuture<'c, AppResult<Vec<T>>>;

/// Owner of a live view. Dropping it stops recomputation and ends every
/// subscription.
pub struct JoinView<T> {
    name: &'static str,
    rx: watch::Receiver<Snapshot<T>>,
    fan_in: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl<T: Send + Sync + 'static> JoinView<T> {
    async fn spawn(
        name: &'static str,
        pool: SqlitePool,
        bus: &ChangeBus,
        tables: &[Table],
        loader: Loader<T>,
    ) -> AppResult<Self> {
        // Subscribe first so writes racing the initial read are not lost.
        let mut sub = bus.subscribe(tables);
        let initial = recompute(&pool, loader).await?;
        let (tx, rx) = watch::channel(Arc::new(initial));

        let pending = Arc::new(Notify::new());
        let fan_in = tokio::spawn({
            let pending = Arc::clone(&pending);
            async move {
                while sub.changed().await.is_some() {
                    pending.notify_one();
                }
            }
        });

        let worker = tokio::spawn(async move {
            loop {
                pending.notified().await;
                match recompute(&pool, loader).await {
                    Ok(rows) => {
                        debug!(target: "cardkeep", event = "view_recomputed", view = name, rows = rows.len());
                        if tx.send(Arc::new(rows)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(target: "cardkeep", event = "view_recompute_failed", view = name, error = %err);
                    }
                }
            }
        });

        Ok(Self {
            name,
            rx,
            fan_in,
            worker,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn latest(&self) -> Snapshot<T> {
        Arc::clone(&self.rx.borrow())
    }

    pub fn subscribe(&self) -> ViewSubscription<T> {
        ViewSubscription {
            rx: self.rx.clone(),
        }
    }
}

impl<T> Drop for JoinView<T> {
    fn drop(&mut self) {
        self.fan_in.abort();
        self.worker.abort();
    }
}

async fn recompute<T>(pool: &SqlitePool, loader: Loader<T>) -> AppResult<Vec<T>> {
    let mut tx = db::begin(pool, "view_read").await?;
    let rows = loader(&mut *tx).await?;
    db::commit(tx, "view_read").await?;
    Ok(rows)
}

pub struct ViewSubscription<T> {
    rx: watch::Receiver<Snapshot<T>>,
}

impl<T: Send + Sync + 'static> ViewSubscription<T> {
    pub fn latest(&self) -> Snapshot<T> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait for the next published snapshot. `None` once the view is gone.
    pub async fn next(&mut self) -> Option<Snapshot<T>> {
        self.rx.changed().await.ok()?;
        Some(Arc::clone(&self.rx.borrow_and_update()))
    }

    /// The current snapshot followed by every later one.
    pub fn into_stream(self) -> impl Stream<Item = Snapshot<T>> {
        stream::unfold((self, true), |(mut sub, first)| async move {
            if first {
                let current = Arc::clone(&sub.rx.borrow_and_update());
                Some((current, (sub, false)))
            } else {
                let next = sub.next().await?;
                Some((next, (sub, false)))
            }
        })
    }
}

fn load_orders(conn: &mut SqliteConnection) -> BoxFuture<'_, AppResult<Vec<OrderWithCards>>> {
    Box::pin(orders::load_with_cards_in(conn))
}

fn load_listings(conn: &mut SqliteConnection) -> BoxFuture<'_, AppResult<Vec<ListingWithCards>>> {
    Box::pin(listings::load_with_cards_in(conn))
}

fn load_cards(conn: &mut SqliteConnection) -> BoxFuture<'_, AppResult<Vec<Card>>> {
    Box::pin(cards::load_all_in(conn))
}

/// Orders with their cards; recomputed on order, link or card changes.
pub async fn observe_orders(
    pool: SqlitePool,
    bus: &ChangeBus,
) -> AppResult<JoinView<OrderWithCards>> {
    JoinView::spawn(
        "orders_with_cards",
        pool,
        bus,
        &[Table::Orders, Table::OrderCards, Table::Cards],
        load_orders,
    )
    .await
}

pub async fn observe_listings(
    pool: SqlitePool,
    bus: &ChangeBus,
) -> AppResult<JoinView<ListingWithCards>> {
    JoinView::spawn(
        "listings_with_cards",
        pool,
        bus,
        &[Table::Listings, Table::ListingCards, Table::Cards],
        load_listings,
    )
    .await
}

pub async fn observe_cards(pool: SqlitePool, bus: &ChangeBus) -> AppResult<JoinView<Card>> {
    JoinView::spawn("cards", pool, bus, &[Table::Cards], load_cards).await
}
