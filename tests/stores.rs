#![allow(clippy::unwrap_used, clippy::expect_used)]

#[path = "util.rs"]
mod util;

use std::time::Duration;

use anyhow::Result;
use cardkeep_lib::{commands, CardDraft, ErrorKind, ListingDraft, OrderDraft, OrderStatus, TermKind};
use tokio::time::timeout;
use util::{draft, memory_state, temp_state};

#[tokio::test]
async fn card_crud_round_trip() -> Result<()> {
    let (_dir, state) = temp_state().await;
    let card = draft(Some("X1"), "Jordan Rookie", "Fleer 86", 12_000).into_card();
    state.cards.insert(&card).await?;

    let loaded = state.cards.get_by_id(&card.id).await?.expect("stored");
    assert_eq!(loaded, card);
    assert_eq!(loaded.grade, "Ungraded");

    state.cards.update_price(&card.id, 15_000).await?;
    let mut changed = card.clone();
    changed.price = 15_000;
    changed.grade = "PSA 9".into();
    state.cards.upsert(&changed).await?;
    assert_eq!(state.cards.get_by_id(&card.id).await?, Some(changed));

    let found = state.cards.find_by_external_ids(&["X1".into(), "nope".into()]).await?;
    assert_eq!(found.len(), 1);

    let outcome = state.cards.delete_by_ids(&[card.id.clone()]).await?;
    assert_eq!(outcome.cards, 1);
    assert!(state.cards.get_all().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn updating_a_missing_card_is_not_found() -> Result<()> {
    let (_dir, state) = memory_state().await;
    let err = state.cards.update_price("missing", 1).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION/NOT_FOUND");
    assert_eq!(err.kind(), ErrorKind::Validation);
    Ok(())
}

#[tokio::test]
async fn create_card_rejects_invalid_drafts_and_records_set_name() -> Result<()> {
    let (_dir, state) = memory_state().await;
    let bad = CardDraft {
        price: -5,
        ..draft(None, "Card", "Set", 0)
    };
    let err = commands::create_card(&state, bad).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION/INVALID_CARD");

    commands::create_card(&state, draft(None, "Card", "  Topps Chrome ", 100)).await?;
    assert_eq!(
        state.autocomplete.get_all(TermKind::Set).await?,
        vec!["Topps Chrome".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn deleting_a_linked_card_cascades_its_links() -> Result<()> {
    let (_dir, state) = memory_state().await;
    let card = draft(None, "A", "S", 100).into_card();
    state.cards.insert(&card).await?;
    let order = state
        .orders
        .create(OrderDraft {
            buyer_name: "Pat".into(),
            ..OrderDraft::default()
        })
        .await?;
    let listing = state
        .listings
        .create(ListingDraft {
            title: "Lot".into(),
            ..ListingDraft::default()
        })
        .await?;
    state.orders.add_cards(&order.id, &[card.id.clone()]).await?;
    state.listings.add_cards(&listing.id, &[card.id.clone()]).await?;

    let outcome = state.cards.delete_by_ids(&[card.id.clone()]).await?;
    assert_eq!(outcome.order_links, 1);
    assert_eq!(outcome.listing_links, 1);
    assert!(state.orders.cards_for_order(&order.id).await?.is_empty());
    assert!(state.listings.cards_for_listing(&listing.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn order_links_mark_cards_sold_and_skip_taken_cards() -> Result<()> {
    let (_dir, state) = memory_state().await;
    let a = draft(None, "A", "S", 500).into_card();
    let b = draft(None, "B", "S", 700).into_card();
    state.cards.insert_many(&[a.clone(), b.clone()]).await?;

    let first = state
        .orders
        .create(OrderDraft {
            buyer_name: "Pat".into(),
            shipping_cost: 100,
            discount_percent: 10,
            ..OrderDraft::default()
        })
        .await?;
    let second = state
        .orders
        .create(OrderDraft {
            buyer_name: "Sam".into(),
            ..OrderDraft::default()
        })
        .await?;

    let outcome = state
        .orders
        .add_cards(&first.id, &[a.id.clone(), b.id.clone(), "ghost".into()])
        .await?;
    assert_eq!(outcome.linked, 2);
    assert_eq!(outcome.skipped, vec!["ghost".to_string()]);

    let sold = state.cards.get_by_id(&a.id).await?.unwrap();
    assert_eq!(sold.sold_price, Some(500));

    let taken = state.orders.add_cards(&second.id, &[a.id.clone()]).await?;
    assert_eq!(taken.linked, 0);
    assert_eq!(taken.skipped, vec![a.id.clone()]);

    let cards = state.orders.cards_for_order(&first.id).await?;
    assert_eq!(cards.len(), 2);

    assert!(state.orders.remove_card(&first.id, &b.id).await?);
    assert!(!state.orders.remove_card(&first.id, &b.id).await?);
    assert_eq!(state.cards.get_by_id(&b.id).await?.unwrap().sold_price, None);
    Ok(())
}

#[tokio::test]
async fn adding_cards_to_a_missing_order_fails() -> Result<()> {
    let (_dir, state) = memory_state().await;
    let err = state
        .orders
        .add_cards("missing", &["c".into()])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION/NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn deleting_an_order_releases_its_cards() -> Result<()> {
    let (_dir, state) = memory_state().await;
    let card = draft(None, "A", "S", 300).into_card();
    state.cards.insert(&card).await?;
    let order = state
        .orders
        .create(OrderDraft {
            buyer_name: "Pat".into(),
            ..OrderDraft::default()
        })
        .await?;
    state.orders.add_cards(&order.id, &[card.id.clone()]).await?;

    assert_eq!(state.orders.delete_by_ids(&[order.id.clone()]).await?, 1);
    assert!(state.orders.get_by_id(&order.id).await?.is_none());
    assert!(state.orders.cards_for_order(&order.id).await?.is_empty());
    let card = state.cards.get_by_id(&card.id).await?.expect("card kept");
    assert_eq!(card.sold_price, None);
    Ok(())
}

#[tokio::test]
async fn order_status_and_tracking_updates() -> Result<()> {
    let (_dir, state) = memory_state().await;
    let order = state
        .orders
        .create(OrderDraft {
            buyer_name: "Pat".into(),
            package_weight: 2.5,
            ..OrderDraft::default()
        })
        .await?;
    assert_eq!(order.status, OrderStatus::New);

    state.orders.update_status(&order.id, OrderStatus::Shipped).await?;
    state
        .orders
        .update_tracking_number(&order.id, Some("1Z999"))
        .await?;
    let stored = state.orders.get_by_id(&order.id).await?.unwrap();
    assert_eq!(stored.status, OrderStatus::Shipped);
    assert_eq!(stored.tracking_number.as_deref(), Some("1Z999"));
    assert_eq!(stored.package_weight, 2.5);

    let err = state
        .orders
        .update_status("missing", OrderStatus::Reserved)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION/NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn listing_links_ignore_unknown_cards_and_duplicates() -> Result<()> {
    let (_dir, state) = memory_state().await;
    let card = draft(None, "A", "S", 100).into_card();
    state.cards.insert(&card).await?;
    let listing = state
        .listings
        .create(ListingDraft {
            title: "Lot".into(),
            nice_prices: true,
            ..ListingDraft::default()
        })
        .await?;

    let linked = state
        .listings
        .add_cards(&listing.id, &[card.id.clone(), card.id.clone(), "ghost".into()])
        .await?;
    assert_eq!(linked, 1);

    assert_eq!(state.listings.delete_by_ids(&[listing.id.clone()]).await?, 1);
    let card = state.cards.get_by_id(&card.id).await?.expect("card kept");
    assert_eq!(card.sold_price, None);
    Ok(())
}

#[tokio::test]
async fn settings_set_get_remove() -> Result<()> {
    let (_dir, state) = memory_state().await;
    let mut changes = state.settings.subscribe();

    state.settings.set("currency", "USD").await?;
    state.settings.set("currency", "EUR").await?;
    assert_eq!(state.settings.get("currency").await?.as_deref(), Some("EUR"));
    assert_eq!(state.settings.get_all().await?.len(), 1);
    assert!(timeout(Duration::from_secs(1), changes.changed()).await?.is_some());

    assert!(state.settings.remove("currency").await?);
    assert!(!state.settings.remove("currency").await?);
    assert_eq!(state.settings.get("currency").await?, None);

    let err = state.settings.set("  ", "x").await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION/EMPTY_KEY");
    Ok(())
}

#[tokio::test]
async fn suggestions_are_prefix_matched_and_escaped() -> Result<()> {
    let (_dir, state) = memory_state().await;
    let store = &state.autocomplete;
    let added = store
        .add_terms(
            TermKind::Player,
            &["michael jordan", "Mike Trout", "Mickey Mantle", "Mike Trout", " ", "50%_off"],
        )
        .await?;
    assert_eq!(added, 4);
    assert!(!store.add_term(TermKind::Player, "Mike Trout").await?);

    assert_eq!(
        store.suggest(TermKind::Player, "mi").await?,
        vec!["michael jordan", "Mickey Mantle", "Mike Trout"]
    );
    assert_eq!(store.suggest(TermKind::Player, "50%").await?, vec!["50%_off"]);
    assert!(store.suggest(TermKind::Player, "%").await?.is_empty());
    assert!(store.suggest(TermKind::Set, "mi").await?.is_empty());
    assert_eq!(store.suggest_limited(TermKind::Player, "", 2).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn order_upsert_replaces_fields_and_keeps_links() -> Result<()> {
    let (_dir, state) = memory_state().await;
    let card = draft(None, "A", "S", 800).into_card();
    state.cards.insert(&card).await?;
    let order = state
        .orders
        .create(OrderDraft {
            buyer_name: "Pat".into(),
            ..OrderDraft::default()
        })
        .await?;
    state.orders.add_cards(&order.id, &[card.id.clone()]).await?;
    let mut changes = state.orders.subscribe();

    let mut edited = order.clone();
    edited.buyer_name = "Pat Lee".into();
    edited.city = "Dublin".into();
    edited.status = OrderStatus::Shipped;
    edited.package_height = 3.25;
    state.orders.upsert(&edited).await?;

    assert_eq!(state.orders.get_by_id(&order.id).await?, Some(edited));
    assert_eq!(state.orders.cards_for_order(&order.id).await?.len(), 1);
    assert!(changes.drain() > 0);

    let fresh = OrderDraft {
        buyer_name: "Sam".into(),
        ..OrderDraft::default()
    }
    .into_order(1_700_000_000_000);
    state.orders.upsert(&fresh).await?;
    assert_eq!(state.orders.get_all().await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn listing_upsert_replaces_fields() -> Result<()> {
    let (_dir, state) = memory_state().await;
    let listing = state
        .listings
        .create(ListingDraft {
            title: "Lot".into(),
            ..ListingDraft::default()
        })
        .await?;

    let mut edited = listing.clone();
    edited.title = "Lot of 3".into();
    edited.discount_percent = 20;
    edited.total_price_override = Some(5_000);
    edited.image_ref = Some("lot.jpg".into());
    state.listings.upsert(&edited).await?;

    assert_eq!(state.listings.get_by_id(&listing.id).await?, Some(edited));
    assert_eq!(state.listings.get_all().await?.len(), 1);
    Ok(())
}
