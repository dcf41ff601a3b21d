/// Priority / ranking tests
///
/// Dense 1..N rankings per scope across insert, delete, scope change and
/// moves, including concurrent inserts into one scope.
/// Run with: cargo test --test priority_tests

use memodata::transaction::TransactionScope;
use memodata::{
    DataDefinition, DataDefinitionBuilder, DataEngine, DataError, EngineConfig, EntityId, FieldType,
    InMemoryExtensions, InMemoryStorage, Restriction, SearchCriteria,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Board {
    engine: DataEngine,
    list: Arc<DataDefinition>,
    card: Arc<DataDefinition>,
}

async fn board() -> Board {
    board_on(DataEngine::in_memory(Arc::new(InMemoryExtensions::new()))).await
}

async fn board_on(engine: DataEngine) -> Board {
    let list = engine
        .define(DataDefinitionBuilder::new("board.list").field("name", FieldType::string()))
        .await
        .unwrap();
    let card = engine
        .define(
            DataDefinitionBuilder::new("board.card")
                .field("title", FieldType::string())
                .field("list", FieldType::lazy_belongs_to("board.list", "name"))
                .field("position", FieldType::priority("list")),
        )
        .await
        .unwrap();
    Board { engine, list, card }
}

impl Board {
    async fn add_list(&self, name: &str) -> EntityId {
        let saved = self
            .engine
            .save(self.list.create().with("name", name).unwrap())
            .await
            .unwrap();
        saved.id().unwrap()
    }

    async fn add_card(&self, title: &str, list: Option<EntityId>) -> EntityId {
        let card = self.card.create().with("title", title).unwrap().with("list", list).unwrap();
        let saved = self.engine.save(card).await.unwrap();
        assert!(saved.is_valid(), "{:?}", saved.field_errors());
        saved.id().unwrap()
    }

    async fn position(&self, id: EntityId) -> i64 {
        let card = self.engine.get("board.card", id).await.unwrap();
        card.get_integer("position").unwrap().unwrap()
    }

    /// (title, position) of a list's cards in ranking order.
    async fn ranking(&self, list: Option<EntityId>) -> Vec<(String, i64)> {
        let scope = match list {
            Some(id) => Restriction::belongs_to("list", id),
            None => Restriction::is_null("list"),
        };
        let found = self
            .engine
            .find("board.card", SearchCriteria::new().add(scope))
            .await
            .unwrap();
        found
            .entities
            .iter()
            .map(|card| {
                (
                    card.get_str("title").unwrap().unwrap().to_string(),
                    card.get_integer("position").unwrap().unwrap(),
                )
            })
            .collect()
    }

    async fn titles(&self, list: Option<EntityId>) -> Vec<String> {
        self.ranking(list).await.into_iter().map(|(title, _)| title).collect()
    }
}

fn assert_dense(ranking: &[(String, i64)]) {
    let positions: Vec<i64> = ranking.iter().map(|(_, position)| *position).collect();
    let expected: Vec<i64> = (1..=ranking.len() as i64).collect();
    assert_eq!(positions, expected, "ranking {:?}", ranking);
}

#[tokio::test]
async fn test_inserts_rank_in_order_and_delete_compacts() {
    let board = board().await;
    let todo = board.add_list("todo").await;

    let a = board.add_card("a", Some(todo)).await;
    let b = board.add_card("b", Some(todo)).await;
    let c = board.add_card("c", Some(todo)).await;
    assert_eq!(board.position(a).await, 1);
    assert_eq!(board.position(b).await, 2);
    assert_eq!(board.position(c).await, 3);

    assert!(board.engine.delete("board.card", b).await.unwrap());
    assert_eq!(board.position(a).await, 1);
    assert_eq!(board.position(c).await, 2);
    assert_eq!(board.ranking(Some(todo)).await, vec![("a".to_string(), 1), ("c".to_string(), 2)]);
}

#[tokio::test]
async fn test_scopes_rank_independently() {
    let board = board().await;
    let todo = board.add_list("todo").await;
    let done = board.add_list("done").await;

    board.add_card("t1", Some(todo)).await;
    board.add_card("d1", Some(done)).await;
    board.add_card("t2", Some(todo)).await;
    board.add_card("loose1", None).await;
    board.add_card("loose2", None).await;

    assert_eq!(board.ranking(Some(todo)).await, vec![("t1".into(), 1), ("t2".into(), 2)]);
    assert_eq!(board.ranking(Some(done)).await, vec![("d1".into(), 1)]);
    assert_eq!(board.ranking(None).await, vec![("loose1".into(), 1), ("loose2".into(), 2)]);
}

#[tokio::test]
async fn test_scope_change_moves_to_end_of_new_scope() {
    let board = board().await;
    let todo = board.add_list("todo").await;
    let done = board.add_list("done").await;

    let a = board.add_card("a", Some(todo)).await;
    board.add_card("b", Some(todo)).await;
    board.add_card("x", Some(done)).await;

    let mut card = board.engine.get("board.card", a).await.unwrap();
    card.set("list", done).unwrap();
    let moved = board.engine.save(card).await.unwrap();
    assert_eq!(moved.get_integer("position").unwrap(), Some(2));

    assert_eq!(board.ranking(Some(todo)).await, vec![("b".into(), 1)]);
    assert_eq!(board.ranking(Some(done)).await, vec![("x".into(), 1), ("a".into(), 2)]);
}

#[tokio::test]
async fn test_priority_is_read_only_for_callers() {
    let board = board().await;
    let todo = board.add_list("todo").await;
    let a = board.add_card("a", Some(todo)).await;
    board.add_card("b", Some(todo)).await;

    // a caller-supplied position is ignored on insert
    let card = board
        .card
        .create()
        .with("title", "c")
        .unwrap()
        .with("list", todo)
        .unwrap()
        .with("position", 1)
        .unwrap();
    let saved = board.engine.save(card).await.unwrap();
    assert_eq!(saved.get_integer("position").unwrap(), Some(3));

    // and on update
    let mut card = board.engine.get("board.card", a).await.unwrap();
    card.set("position", 3).unwrap();
    card.set("title", "a2").unwrap();
    let updated = board.engine.save(card).await.unwrap();
    assert_eq!(updated.get_integer("position").unwrap(), Some(1));

    // JSON input cannot carry it at all
    let from_json = board
        .card
        .entity_from_json(&json!({ "title": "d", "list": todo, "position": 1 }))
        .unwrap();
    assert!(from_json.get("position").unwrap().is_null());

    assert_dense(&board.ranking(Some(todo)).await);
}

#[tokio::test]
async fn test_move_to_and_move_by() {
    let board = board().await;
    let todo = board.add_list("todo").await;
    let a = board.add_card("a", Some(todo)).await;
    board.add_card("b", Some(todo)).await;
    let c = board.add_card("c", Some(todo)).await;
    board.add_card("d", Some(todo)).await;

    assert_eq!(board.engine.move_to("board.card", c, 1).await.unwrap(), 1);
    assert_eq!(board.titles(Some(todo)).await, vec!["c", "a", "b", "d"]);

    assert_eq!(board.engine.move_by("board.card", a, 2).await.unwrap(), 4);
    assert_eq!(board.titles(Some(todo)).await, vec!["c", "b", "d", "a"]);

    assert_eq!(board.engine.move_by("board.card", a, -1).await.unwrap(), 3);
    assert_eq!(board.titles(Some(todo)).await, vec!["c", "b", "a", "d"]);

    // clamped at both ends
    assert_eq!(board.engine.move_to("board.card", c, 0).await.unwrap(), 1);
    assert_eq!(board.engine.move_by("board.card", c, 100).await.unwrap(), 4);
    assert_eq!(board.titles(Some(todo)).await, vec!["b", "a", "d", "c"]);
    assert_dense(&board.ranking(Some(todo)).await);

    assert!(matches!(
        board.engine.move_to("board.list", todo, 1).await,
        Err(DataError::TypeMismatch(_))
    ));
    assert!(matches!(
        board.engine.move_to("board.card", 999, 1).await,
        Err(DataError::EntityNotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_get_distinct_contiguous_priorities() {
    let board = Arc::new(board().await);
    let todo = board.add_list("todo").await;

    let mut handles = Vec::new();
    for i in 0..24 {
        let board = board.clone();
        handles.push(tokio::spawn(async move {
            board.add_card(&format!("card-{}", i), Some(todo)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let ranking = board.ranking(Some(todo)).await;
    assert_eq!(ranking.len(), 24);
    assert_dense(&ranking);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deletes_and_inserts_keep_ranking_dense() {
    let board = Arc::new(board().await);
    let todo = board.add_list("todo").await;
    let mut ids = Vec::new();
    for i in 0..12 {
        ids.push(board.add_card(&format!("old-{}", i), Some(todo)).await);
    }

    let mut handles = Vec::new();
    for (i, id) in ids.into_iter().enumerate() {
        let board = board.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                board.engine.delete("board.card", id).await.unwrap();
            } else {
                board.add_card(&format!("new-{}", i), Some(todo)).await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let ranking = board.ranking(Some(todo)).await;
    assert_eq!(ranking.len(), 12);
    assert_dense(&ranking);
}

#[tokio::test]
async fn test_held_scope_lock_times_out_other_writers() {
    let config = EngineConfig::new().scope_lock_timeout(Duration::from_millis(50));
    let engine = DataEngine::new(Arc::new(InMemoryStorage::new()), Arc::new(InMemoryExtensions::new()), config);
    let list = engine
        .define(DataDefinitionBuilder::new("board.list").field("name", FieldType::string()))
        .await
        .unwrap();
    let card = engine
        .define(
            DataDefinitionBuilder::new("board.card")
                .field("title", FieldType::string())
                .field("list", FieldType::lazy_belongs_to("board.list", "name"))
                .field("position", FieldType::priority("list")),
        )
        .await
        .unwrap();
    let todo = engine.save(list.create().with("name", "todo").unwrap()).await.unwrap();
    let todo = todo.id().unwrap();

    // hold the scope the way an in-flight save would
    let service = engine.data_access().clone();
    let mut txn = TransactionScope::begin(service.storage().clone()).await.unwrap();
    service.priority().lock(&mut txn, &card, [Some(todo)]).await.unwrap();

    let blocked = card.create().with("title", "a").unwrap().with("list", todo).unwrap();
    let err = engine.save(blocked.clone()).await.unwrap_err();
    assert!(matches!(err, DataError::LockTimeout(ref scope) if scope == &format!("board.card[{}]", todo)));
    assert_eq!(engine.find("board.card", SearchCriteria::new()).await.unwrap().total_entities, 0);

    // other scopes are not blocked
    let loose = engine.save(card.create().with("title", "b").unwrap()).await.unwrap();
    assert_eq!(loose.get_integer("position").unwrap(), Some(1));

    txn.rollback().unwrap();
    let saved = engine.save(blocked).await.unwrap();
    assert_eq!(saved.get_integer("position").unwrap(), Some(1));
}

#[derive(Debug, Clone)]
enum Op {
    Insert(usize),
    Delete(usize),
    Reparent(usize, usize),
    Move(usize, i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..3usize).prop_map(Op::Insert),
        1 => any::<usize>().prop_map(Op::Delete),
        1 => (any::<usize>(), 0..3usize).prop_map(|(card, list)| Op::Reparent(card, list)),
        1 => (any::<usize>(), -2..8i64).prop_map(|(card, position)| Op::Move(card, position)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_rankings_stay_dense(ops in prop::collection::vec(op(), 1..24)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let board = board().await;
            let lists = vec![
                Some(board.add_list("a").await),
                Some(board.add_list("b").await),
                None,
            ];
            let mut cards: Vec<EntityId> = Vec::new();

            for (step, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Insert(list) => {
                        cards.push(board.add_card(&format!("c{}", step), lists[list]).await);
                    }
                    Op::Delete(pick) if !cards.is_empty() => {
                        let id = cards.remove(pick % cards.len());
                        assert!(board.engine.delete("board.card", id).await.unwrap());
                    }
                    Op::Reparent(pick, list) if !cards.is_empty() => {
                        let id = cards[pick % cards.len()];
                        let mut card = board.engine.get("board.card", id).await.unwrap();
                        card.set("list", lists[list]).unwrap();
                        assert!(board.engine.save(card).await.unwrap().is_valid());
                    }
                    Op::Move(pick, position) if !cards.is_empty() => {
                        let id = cards[pick % cards.len()];
                        board.engine.move_to("board.card", id, position).await.unwrap();
                    }
                    _ => {}
                }

                let mut total = 0;
                for list in &lists {
                    let ranking = board.ranking(*list).await;
                    assert_dense(&ranking);
                    total += ranking.len();
                }
                assert_eq!(total, cards.len());
            }
        });
    }
}

#[tokio::test]
async fn test_finished_scopes_and_rollbacks_leave_nothing_behind() {
    let storage = Arc::new(InMemoryStorage::new());
    let board = board_on(DataEngine::new(
        storage.clone(),
        Arc::new(InMemoryExtensions::new()),
        EngineConfig::new(),
    ))
    .await;

    for round in 0..200 {
        let list = board.add_list(&format!("list {}", round)).await;
        let card = board.add_card("card", Some(list)).await;
        assert!(board.engine.delete("board.card", card).await.unwrap());
        assert!(board.engine.delete("board.list", list).await.unwrap());

        let dangling = board.card.create().with("title", "late").unwrap().with("list", list).unwrap();
        assert!(!board.engine.save(dangling).await.unwrap().is_valid());
    }
    // any later statement reclaims the last rollback
    assert!(board.ranking(None).await.is_empty());

    assert!(board.engine.data_access().priority().locks().scope_count() <= 1);
    assert_eq!(storage.transaction_manager().aborted_count().unwrap(), 0);
    assert_eq!(storage.row_count("board_card").await.unwrap(), 0);
    assert_eq!(storage.row_count("board_list").await.unwrap(), 0);
}
