//! Convergence of replicas under concurrent editing.
//!
//! Replicas edit independently, then every delta is delivered to every other
//! replica in a different order per receiver. All replicas must end with the
//! same tree and the same state vector.

use proptest::prelude::*;
use proptest::test_runner::Config;
use yrs::updates::decoder::Decode;
use yrs::StateVector;

use tandem_core::{
    ApplyOutcome, Block, BlockPath, DocumentTree, MarkChange, Mark, Marks, Mutation, ReplicaId,
    ReplicatedDocument, UpdateDelta,
};

fn replica(id: u64) -> ReplicatedDocument {
    ReplicatedDocument::create("abc", ReplicaId::new(id).unwrap(), None).unwrap()
}

/// Encoded clocks list clients in no fixed order; compare them decoded.
fn clock(doc: &ReplicatedDocument) -> StateVector {
    StateVector::decode_v1(&doc.state_vector()).unwrap()
}

/// Applies one randomly chosen edit; `None` when the edit was a no-op or invalid.
fn random_edit(doc: &mut ReplicatedDocument, kind: u8, ratio: f64, text: &str) -> Option<UpdateDelta> {
    let tree = doc.tree();
    let paths = tree.textblock_paths();
    if paths.is_empty() {
        return doc
            .apply_local_mutation(Mutation::InsertBlock {
                at: BlockPath::root(0),
                block: Block::paragraph(text),
            })
            .ok()
            .flatten();
    }
    let path = paths[(ratio * paths.len() as f64) as usize % paths.len()].clone();
    let len = tree.block_at(&path)?.text_len();
    let offset = ((ratio * (len + 1) as f64) as u32).min(len);

    let mutation = match kind {
        0 | 1 => Mutation::insert_text(path, offset, text, Marks::plain()),
        2 if len > 0 => Mutation::delete_text(path, offset.min(len - 1), 1),
        3 => Mutation::FormatText {
            path,
            offset,
            len: len - offset,
            change: MarkChange::Set(Mark::Bold),
        },
        4 => Mutation::SplitBlock { path, offset },
        5 => Mutation::JoinBackward { path },
        6 => Mutation::remove_block(path),
        _ => Mutation::insert_text(path, 0, text, Marks::bold()),
    };
    doc.apply_local_mutation(mutation).ok().flatten()
}

fn exchange(replicas: &mut [ReplicatedDocument], deltas: &[UpdateDelta]) {
    for (i, doc) in replicas.iter_mut().enumerate() {
        // Each receiver sees a different rotation, half of them reversed.
        let mut order: Vec<&UpdateDelta> = deltas.iter().collect();
        let n = order.len().max(1);
        order.rotate_left(i % n);
        if i % 2 == 1 {
            order.reverse();
        }
        for delta in order {
            if delta.origin != doc.replica_id() {
                doc.apply_remote_delta(delta).unwrap();
            }
        }
    }
}

fn verify_convergence(replicas: &[ReplicatedDocument]) -> Result<(), TestCaseError> {
    let first = replicas[0].tree();
    for (i, doc) in replicas.iter().enumerate().skip(1) {
        prop_assert_eq!(&doc.tree(), &first, "Replica {} diverged from replica 0", i);
        prop_assert_eq!(clock(doc), clock(&replicas[0]));
        prop_assert_eq!(doc.pending_len(), 0);
    }
    Ok(())
}

proptest! {
    #![proptest_config(Config {
        cases: 64,
        ..Config::default()
    })]

    #[test]
    fn fuzz_concurrent_edits_converge(
        num_replicas in 2usize..=4,
        edits in prop::collection::vec((0usize..4, 0u8..8, 0.0..1.0f64, "[a-z]{1,4}"), 1..40),
    ) {
        let mut replicas: Vec<ReplicatedDocument> =
            (1..=num_replicas as u64).map(replica).collect();
        let mut deltas = Vec::new();
        for (who, kind, ratio, text) in &edits {
            let doc = &mut replicas[who % num_replicas];
            if let Some(delta) = random_edit(doc, *kind, *ratio, text) {
                deltas.push(delta);
            }
        }

        exchange(&mut replicas, &deltas);
        verify_convergence(&replicas)?;
    }

    #[test]
    fn fuzz_redelivery_is_idempotent(
        edits in prop::collection::vec((0u8..8, 0.0..1.0f64, "[a-z]{1,3}"), 1..20),
    ) {
        let mut source = replica(1);
        let deltas: Vec<UpdateDelta> = edits
            .iter()
            .filter_map(|(kind, ratio, text)| random_edit(&mut source, *kind, *ratio, text))
            .collect();

        let mut once = replica(2);
        let mut twice = replica(3);
        for delta in &deltas {
            once.apply_remote_delta(delta).unwrap();
            twice.apply_remote_delta(delta).unwrap();
            prop_assert_eq!(twice.apply_remote_delta(delta).unwrap(), ApplyOutcome::Duplicate);
        }
        prop_assert_eq!(once.tree(), twice.tree());
        prop_assert_eq!(once.tree(), source.tree());
    }
}

#[test]
fn split_and_join_against_block_replacement_converges() {
    let mut r1 = replica(1);
    let mut r3 = replica(3);
    let edit = |doc: &mut ReplicatedDocument, mutation| doc.apply_local_mutation(mutation).unwrap().unwrap();

    let from_r3 = vec![
        edit(&mut r3, Mutation::insert_text(BlockPath::root(0), 0, "a", Marks::plain())),
        edit(&mut r3, Mutation::SplitBlock { path: BlockPath::root(0), offset: 1 }),
        edit(&mut r3, Mutation::JoinBackward { path: BlockPath::root(1) }),
    ];
    let from_r1 = vec![
        edit(&mut r1, Mutation::remove_block(BlockPath::root(0))),
        edit(
            &mut r1,
            Mutation::InsertBlock {
                at: BlockPath::root(0),
                block: Block::paragraph("a"),
            },
        ),
    ];

    for delta in &from_r3 {
        r1.apply_remote_delta(delta).unwrap();
    }
    for delta in &from_r1 {
        r3.apply_remote_delta(delta).unwrap();
    }
    assert_eq!(r1.tree(), r3.tree());
    assert_eq!(clock(&r1), clock(&r3));

    // A replica that only ever replayed deltas agrees with both authors.
    let mut r2 = replica(2);
    for delta in from_r1.iter().chain(&from_r3) {
        r2.apply_remote_delta(delta).unwrap();
    }
    assert_eq!(r2.tree(), r1.tree());
}

#[test]
fn concurrent_inserts_at_same_position_keep_both() {
    let mut a = replica(1);
    let mut b = replica(2);
    let foo = a
        .apply_local_mutation(Mutation::insert_text(BlockPath::root(0), 0, "foo", Marks::plain()))
        .unwrap()
        .unwrap();
    let bar = b
        .apply_local_mutation(Mutation::insert_text(BlockPath::root(0), 0, "bar", Marks::plain()))
        .unwrap()
        .unwrap();

    assert_eq!(a.apply_remote_delta(&bar).unwrap(), ApplyOutcome::Applied);
    assert_eq!(b.apply_remote_delta(&foo).unwrap(), ApplyOutcome::Applied);

    // Lower replica id first.
    assert_eq!(a.tree().plain_text(), "foobar");
    assert_eq!(a.tree(), b.tree());
}

#[test]
fn concurrent_removal_can_drain_a_list_item() {
    let tree = DocumentTree::new(vec![Block::BulletList(vec![tandem_core::ListItem::new(vec![
        Block::paragraph("one"),
        Block::paragraph("two"),
    ])])])
    .unwrap();
    let snapshot = tandem_core::Snapshot::from_tree(tree);
    let mut a = ReplicatedDocument::create("abc", ReplicaId::new(1).unwrap(), Some(&snapshot)).unwrap();
    let mut b = ReplicatedDocument::create("abc", ReplicaId::new(2).unwrap(), Some(&snapshot)).unwrap();

    let from_a = a
        .apply_local_mutation(Mutation::remove_block(BlockPath::new(vec![0, 0, 0])))
        .unwrap()
        .unwrap();
    let from_b = b
        .apply_local_mutation(Mutation::remove_block(BlockPath::new(vec![0, 0, 1])))
        .unwrap()
        .unwrap();
    a.apply_remote_delta(&from_b).unwrap();
    b.apply_remote_delta(&from_a).unwrap();

    assert_eq!(a.tree(), b.tree());
    assert_eq!(
        a.tree().blocks(),
        &[Block::BulletList(vec![tandem_core::ListItem::new(Vec::new())])]
    );
}
