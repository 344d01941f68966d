use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{
    encode::IsNull,
    error::BoxDynError,
    sqlite::{SqliteArgumentValue, SqliteRow, SqliteTypeInfo, SqliteValueRef},
    Row, Sqlite, SqliteConnection, SqlitePool,
};
use tracing::{info, warn};

use crate::cards::{self, Card};
use crate::id::new_uuid_v7;
use crate::notify::{ChangeBus, Subscription, Table};
use crate::time::now_ms;
use crate::{db, AppError, AppResult};

const ORDER_COLUMNS: &str = "id, buyer_name, address_line1, address_line2, city, state, \
     postal_code, country, shipping_type, shipping_cost, status, created_at, tracking_number, \
     discount_percent, package_length, package_width, package_height, package_weight";

/// Fulfilment stage. Ordered; moving forward is a convention the store
/// does not enforce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    New,
    Reserved,
    ReadyForLabel,
    LabelCreated,
    Shipped,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::Reserved => "reserved",
            OrderStatus::ReadyForLabel => "ready_for_label",
            OrderStatus::LabelCreated => "label_created",
            OrderStatus::Shipped => "shipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "new" => Some(OrderStatus::New),
            "reserved" => Some(OrderStatus::Reserved),
            "ready_for_label" => Some(OrderStatus::ReadyForLabel),
            "label_created" => Some(OrderStatus::LabelCreated),
            "shipped" => Some(OrderStatus::Shipped),
            _ => None,
        }
    }

    /// The following stage, or `None` once shipped.
    pub fn next(&self) -> Option<Self> {
        match self {
            OrderStatus::New => Some(OrderStatus::Reserved),
            OrderStatus::Reserved => Some(OrderStatus::ReadyForLabel),
            OrderStatus::ReadyForLabel => Some(OrderStatus::LabelCreated),
            OrderStatus::LabelCreated => Some(OrderStatus::Shipped),
            OrderStatus::Shipped => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<Sqlite> for OrderStatus {
    fn type_info() -> SqliteTypeInfo {
        <&str as sqlx::Type<Sqlite>>::type_info()
    }

    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <&str as sqlx::Type<Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, Sqlite> for OrderStatus {
    fn encode_by_ref(&self, buf: &mut Vec<SqliteArgumentValue<'q>>) -> Result<IsNull, BoxDynError> {
        <&str as sqlx::Encode<'q, Sqlite>>::encode_by_ref(&self.as_str(), buf)
    }
}

impl<'r> sqlx::Decode<'r, Sqlite> for OrderStatus {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <&str as sqlx::Decode<'r, Sqlite>>::decode(value)?;
        OrderStatus::parse(raw).ok_or_else(|| format!("invalid order status: {raw}").into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub buyer_name: String,
    pub address_line1: String,
    #[serde(default)]
    pub address_line2: Option<String>,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
    pub shipping_type: String,
    pub shipping_cost: i64,
    pub status: OrderStatus,
    pub created_at: i64,
    #[serde(default)]
    pub tracking_number: Option<String>,
    pub discount_percent: i64,
    pub package_length: f64,
    pub package_width: f64,
    pub package_height: f64,
    pub package_weight: f64,
}

impl Order {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Order {
            id: row.try_get("id")?,
            buyer_name: row.try_get("buyer_name")?,
            address_line1: row.try_get("address_line1")?,
            address_line2: row.try_get("address_line2")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            postal_code: row.try_get("postal_code")?,
            country: row.try_get("country")?,
            shipping_type: row.try_get("shipping_type")?,
            shipping_cost: row.try_get("shipping_cost")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            tracking_number: row.try_get("tracking_number")?,
            discount_percent: row.try_get("discount_percent")?,
            package_length: row.try_get("package_length")?,
            package_width: row.try_get("package_width")?,
            package_height: row.try_get("package_height")?,
            package_weight: row.try_get("package_weight")?,
        })
    }
}

/// Caller-supplied fields for a new order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub buyer_name: String,
    pub address_line1: String,
    pub address_line2: Option<String>,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
    pub shipping_type: String,
    pub shipping_cost: i64,
    pub discount_percent: i64,
    pub package_length: f64,
    pub package_width: f64,
    pub package_height: f64,
    pub package_weight: f64,
}

impl OrderDraft {
    pub fn into_order(self, created_at: i64) -> Order {
        Order {
            id: new_uuid_v7(),
            buyer_name: self.buyer_name,
            address_line1: self.address_line1,
            address_line2: self.address_line2,
            city: self.city,
            state: self.state,
            postal_code: self.postal_code,
            country: self.country,
            shipping_type: self.shipping_type,
            shipping_cost: self.shipping_cost,
            status: OrderStatus::New,
            created_at,
            tracking_number: None,
            discount_percent: self.discount_percent,
            package_length: self.package_length,
            package_width: self.package_width,
            package_height: self.package_height,
            package_weight: self.package_weight,
        }
    }
}

/// An order joined with the cards it ships.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderWithCards {
    pub order: Order,
    pub cards: Vec<Card>,
}

impl OrderWithCards {
    /// Sum of card prices.
    pub fn subtotal(&self) -> i64 {
        self.cards.iter().map(|c| c.price).sum()
    }

    /// Subtotal less the order discount, plus shipping.
    pub fn total(&self) -> i64 {
        let subtotal = self.subtotal();
        subtotal - subtotal * self.order.discount_percent / 100 + self.order.shipping_cost
    }
}

/// Result of linking cards to an order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkOutcome {
    pub linked: u64,
    /// Card ids left alone: unknown, already linked here, or held by another order.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OrderStore {
    pool: SqlitePool,
    bus: ChangeBus,
}

impl OrderStore {
    pub(crate) fn new(pool: SqlitePool, bus: ChangeBus) -> Self {
        Self { pool, bus }
    }

    pub async fn get_all(&self) -> AppResult<Vec<Order>> {
        let mut conn = self.pool.acquire().await?;
        load_all_in(&mut *conn).await
    }

    pub async fn get_by_id(&self, id: &str) -> AppResult<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(Order::from_row)
            .transpose()
            .map_err(AppError::from)
    }

    pub async fn create(&self, draft: OrderDraft) -> AppResult<Order> {
        let order = draft.into_order(now_ms());
        self.insert(&order).await?;
        info!(target: "cardkeep", event = "order_created", id = %order.id);
        Ok(order)
    }

    pub async fn insert(&self, order: &Order) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_in(&mut *conn, order).await?;
        self.bus.notify(Table::Orders);
        Ok(())
    }

    /// Insert or replace every field of the order keyed by id. Card links
    /// are kept.
    pub async fn upsert(&self, order: &Order) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_in(&mut *conn, order).await?;
        self.bus.notify(Table::Orders);
        Ok(())
    }

    pub async fn update_status(&self, id: &str, status: OrderStatus) -> AppResult<()> {
        let res = sqlx::query("UPDATE orders SET status = ?1 WHERE id = ?2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(AppError::not_found("order", id));
        }
        self.bus.notify(Table::Orders);
        Ok(())
    }

    pub async fn update_tracking_number(&self, id: &str, tracking: Option<&str>) -> AppResult<()> {
        let res = sqlx::query("UPDATE orders SET tracking_number = ?1 WHERE id = ?2")
            .bind(tracking)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(AppError::not_found("order", id));
        }
        self.bus.notify(Table::Orders);
        Ok(())
    }

    /// Delete orders together with their card links. Linked cards stay in
    /// the store and return to the collection (sold price cleared).
    pub async fn delete_by_ids(&self, ids: &[String]) -> AppResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let list = db::json_id_list(ids)?;
        let mut tx = db::begin(&self.pool, "orders_delete").await?;
        let released = sqlx::query(
            "UPDATE cards SET sold_price = NULL
              WHERE id IN (SELECT card_id FROM order_cards
                            WHERE order_id IN (SELECT value FROM json_each(?1)))",
        )
        .bind(&list)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let links = sqlx::query(
            "DELETE FROM order_cards WHERE order_id IN (SELECT value FROM json_each(?1))",
        )
        .bind(&list)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let deleted =
            sqlx::query("DELETE FROM orders WHERE id IN (SELECT value FROM json_each(?1))")
                .bind(&list)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        db::commit(tx, "orders_delete").await?;

        info!(
            target: "cardkeep",
            event = "orders_deleted",
            orders = deleted,
            links,
            released_cards = released
        );
        self.bus
            .notify_all(&[Table::OrderCards, Table::Orders, Table::Cards]);
        Ok(deleted)
    }

    /// Link cards to an order and mark them sold at their current price.
    /// A card already held by a different order is skipped.
    pub async fn add_cards(&self, order_id: &str, card_ids: &[String]) -> AppResult<LinkOutcome> {
        let mut tx = db::begin(&self.pool, "order_add_cards").await?;
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM orders WHERE id = ?1")
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(AppError::not_found("order", order_id));
        }

        let mut outcome = LinkOutcome::default();
        for card_id in card_ids {
            let card_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM cards WHERE id = ?1")
                .bind(card_id)
                .fetch_optional(&mut *tx)
                .await?;
            let holder: Option<String> =
                sqlx::query_scalar("SELECT order_id FROM order_cards WHERE card_id = ?1 LIMIT 1")
                    .bind(card_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            match (card_exists, holder) {
                (None, _) => {
                    warn!(target: "cardkeep", event = "order_link_unknown_card", order_id, card_id = %card_id);
                    outcome.skipped.push(card_id.clone());
                }
                (Some(_), Some(holder)) => {
                    if holder != order_id {
                        warn!(
                            target: "cardkeep",
                            event = "order_link_card_taken",
                            order_id,
                            card_id = %card_id,
                            held_by = %holder
                        );
                    }
                    outcome.skipped.push(card_id.clone());
                }
                (Some(_), None) => {
                    sqlx::query("INSERT INTO order_cards (order_id, card_id) VALUES (?1, ?2)")
                        .bind(order_id)
                        .bind(card_id)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(
                        "UPDATE cards SET sold_price = price WHERE id = ?1 AND sold_price IS NULL",
                    )
                    .bind(card_id)
                    .execute(&mut *tx)
                    .await?;
                    outcome.linked += 1;
                }
            }
        }
        db::commit(tx, "order_add_cards").await?;

        if outcome.linked > 0 {
            self.bus.notify_all(&[Table::OrderCards, Table::Cards]);
        }
        Ok(outcome)
    }

    /// Unlink one card; it goes back to the collection. Returns whether a
    /// link existed.
    pub async fn remove_card(&self, order_id: &str, card_id: &str) -> AppResult<bool> {
        let mut tx = db::begin(&self.pool, "order_remove_card").await?;
        let removed = sqlx::query("DELETE FROM order_cards WHERE order_id = ?1 AND card_id = ?2")
            .bind(order_id)
            .bind(card_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed > 0 {
            sqlx::query("UPDATE cards SET sold_price = NULL WHERE id = ?1")
                .bind(card_id)
                .execute(&mut *tx)
                .await?;
        }
        db::commit(tx, "order_remove_card").await?;

        if removed > 0 {
            self.bus.notify_all(&[Table::OrderCards, Table::Cards]);
        }
        Ok(removed > 0)
    }

    pub async fn cards_for_order(&self, order_id: &str) -> AppResult<Vec<Card>> {
        let rows = sqlx::query(
            "SELECT c.id, c.external_id, c.name, c.set_name, c.price, c.grade, c.sold_price
               FROM order_cards oc
               JOIN cards c ON c.id = oc.card_id
              WHERE oc.order_id = ?1
              ORDER BY c.name, c.id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Card::from_row(row).map_err(AppError::from))
            .collect()
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe(&[Table::Orders])
    }
}

pub(crate) async fn insert_in(conn: &mut SqliteConnection, order: &Order) -> AppResult<()> {
    write_in(conn, order, false).await
}

pub(crate) async fn upsert_in(conn: &mut SqliteConnection, order: &Order) -> AppResult<()> {
    write_in(conn, order, true).await
}

async fn write_in(conn: &mut SqliteConnection, order: &Order, upsert: bool) -> AppResult<()> {
    let conflict = if upsert {
        " ON CONFLICT(id) DO UPDATE SET
           buyer_name = excluded.buyer_name,
           address_line1 = excluded.address_line1,
           address_line2 = excluded.address_line2,
           city = excluded.city,
           state = excluded.state,
           postal_code = excluded.postal_code,
           country = excluded.country,
           shipping_type = excluded.shipping_type,
           shipping_cost = excluded.shipping_cost,
           status = excluded.status,
           created_at = excluded.created_at,
           tracking_number = excluded.tracking_number,
           discount_percent = excluded.discount_percent,
           package_length = excluded.package_length,
           package_width = excluded.package_width,
           package_height = excluded.package_height,
           package_weight = excluded.package_weight"
    } else {
        ""
    };
    let sql = format!(
        "INSERT INTO orders ({ORDER_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18){conflict}"
    );
    sqlx::query(&sql)
        .bind(&order.id)
        .bind(&order.buyer_name)
        .bind(&order.address_line1)
        .bind(&order.address_line2)
        .bind(&order.city)
        .bind(&order.state)
        .bind(&order.postal_code)
        .bind(&order.country)
        .bind(&order.shipping_type)
        .bind(order.shipping_cost)
        .bind(order.status)
        .bind(order.created_at)
        .bind(&order.tracking_number)
        .bind(order.discount_percent)
        .bind(order.package_length)
        .bind(order.package_width)
        .bind(order.package_height)
        .bind(order.package_weight)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn load_all_in(conn: &mut SqliteConnection) -> AppResult<Vec<Order>> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC, id");
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| Order::from_row(row).map_err(AppError::from))
        .collect()
}

/// `(order_id, card_id)` pairs.
pub(crate) async fn load_links_in(conn: &mut SqliteConnection) -> AppResult<Vec<(String, String)>> {
    let rows = sqlx::query("SELECT order_id, card_id FROM order_cards ORDER BY order_id, card_id")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| Ok((row.try_get("order_id")?, row.try_get("card_id")?)))
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(AppError::from)
}

/// Every order with its cards, read on one connection.
pub(crate) async fn load_with_cards_in(conn: &mut SqliteConnection) -> AppResult<Vec<OrderWithCards>> {
    let orders = load_all_in(conn).await?;
    let links = load_links_in(conn).await?;
    let cards: HashMap<String, Card> = cards::load_all_in(conn)
        .await?
        .into_iter()
        .map(|card| (card.id.clone(), card))
        .collect();

    let mut by_order: HashMap<String, Vec<Card>> = HashMap::new();
    for (order_id, card_id) in links {
        if let Some(card) = cards.get(&card_id) {
            by_order.entry(order_id).or_default().push(card.clone());
        }
    }

    Ok(orders
        .into_iter()
        .map(|order| {
            let mut cards = by_order.remove(&order.id).unwrap_or_default();
            cards.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
            OrderWithCards { order, cards }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_and_orders() {
        for status in [
            OrderStatus::New,
            OrderStatus::Reserved,
            OrderStatus::ReadyForLabel,
            OrderStatus::LabelCreated,
            OrderStatus::Shipped,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert!(OrderStatus::New < OrderStatus::Shipped);
        assert_eq!(OrderStatus::LabelCreated.next(), Some(OrderStatus::Shipped));
        assert_eq!(OrderStatus::Shipped.next(), None);
        assert_eq!(OrderStatus::parse("lost"), None);
    }

    #[test]
    fn totals_apply_discount_then_shipping() {
        let mut order = OrderDraft {
            buyer_name: "Sam".into(),
            shipping_cost: 500,
            discount_percent: 10,
            ..OrderDraft::default()
        }
        .into_order(0);
        order.id = "o1".into();
        let card = |id: &str, price| Card {
            id: id.into(),
            external_id: None,
            name: id.into(),
            set_name: "Prizm".into(),
            price,
            grade: "Ungraded".into(),
            sold_price: Some(price),
        };
        let view = OrderWithCards {
            order,
            cards: vec![card("a", 1000), card("b", 2000)],
        };
        assert_eq!(view.subtotal(), 3000);
        assert_eq!(view.total(), 3000 - 300 + 500);
    }
}
