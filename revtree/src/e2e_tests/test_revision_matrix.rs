//! Insert, delete and reinsert phases across tree orders, key orders and
//! points where a new revision is opened.

use crate::e2e_tests::helpers::*;

const COUNT: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deletion {
    None,
    HalfFirst,
    HalfLast,
    HalfShuffle,
    AllAscending,
    AllDescending,
    AllShuffle,
}

impl Deletion {
    const ALL: [Self; 7] = [
        Self::None,
        Self::HalfFirst,
        Self::HalfLast,
        Self::HalfShuffle,
        Self::AllAscending,
        Self::AllDescending,
        Self::AllShuffle,
    ];

    fn keys(self, all: &[i64]) -> Vec<i64> {
        let half = all.len() / 2;
        match self {
            Self::None => Vec::new(),
            Self::HalfFirst => all[..half].to_vec(),
            Self::HalfLast => KeyOrder::Descending.arrange(all)[..half].to_vec(),
            Self::HalfShuffle => KeyOrder::Shuffle.arrange(all)[..half].to_vec(),
            Self::AllAscending => all.to_vec(),
            Self::AllDescending => KeyOrder::Descending.arrange(all),
            Self::AllShuffle => KeyOrder::Shuffle.arrange(all),
        }
    }
}

/// Where a new revision is opened on the current snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RevisionChange {
    Never,
    BeforeDelete,
    BeforeReinsert,
    BeforeCheck,
}

const REVISION_CHANGES: [RevisionChange; 4] = [
    RevisionChange::Never,
    RevisionChange::BeforeDelete,
    RevisionChange::BeforeReinsert,
    RevisionChange::BeforeCheck,
];

async fn run(order: usize, insertion: KeyOrder, deletion: Deletion, change: RevisionChange) {
    let all: Vec<i64> = (1..=COUNT).map(|k| k * 3).collect();
    let mut tree = new_tree(order);

    for key in insertion.arrange(&all) {
        insert_all(&mut tree, &[key]).await;
        verify(&tree).await;
    }
    assert_eq!(keys(&tree).await, all);
    let populated = next_revision(&tree);

    if change == RevisionChange::BeforeDelete {
        tree = next_revision(&tree);
    }
    let deleted = deletion.keys(&all);
    for key in &deleted {
        assert!(tree.delete(key).await.unwrap(), "delete {key}");
        assert!(!tree.delete(key).await.unwrap());
        verify(&tree).await;
    }
    let mut remaining: Vec<i64> = all.iter().copied().filter(|k| !deleted.contains(k)).collect();
    assert_eq!(keys(&tree).await, remaining);

    if change == RevisionChange::BeforeReinsert {
        tree = next_revision(&tree);
    }
    for key in &deleted {
        insert_all(&mut tree, &[*key]).await;
        verify(&tree).await;
        remaining.push(*key);
    }
    remaining.sort_unstable();
    assert_eq!(remaining, all);

    if change == RevisionChange::BeforeCheck {
        tree = next_revision(&tree);
    }
    assert_eq!(keys(&tree).await, all);
    for key in &all {
        assert!(tree.find(key).await.unwrap().is_some());
        assert!(tree.find(&(key + 1)).await.unwrap().is_none());
    }

    // Opening a revision before the first delete keeps the populated
    // snapshot untouched by every later phase.
    if change == RevisionChange::BeforeDelete {
        assert_eq!(keys(&populated).await, all);
        verify(&populated).await;
    }
}

#[tokio::test]
async fn test_revision_matrix() {
    for change in REVISION_CHANGES {
        for insertion in KeyOrder::ALL {
            for deletion in Deletion::ALL {
                for order in [6, 7, 8, 9] {
                    run(order, insertion, deletion, change).await;
                }
            }
        }
    }
}
