use std::collections::{HashMap, HashSet};

use super::message::Message;
use crate::app::domain::types::MessageId;

/// Collect `root` and every transitive descendant among `messages`.
///
/// The parent→children map is built in one pass; traversal uses an explicit
/// stack so arbitrarily deep chains cannot overflow the call stack. `root` is
/// included even if it is absent from `messages`.
pub fn collect_subtree<'a, I>(messages: I, root: &MessageId) -> HashSet<MessageId>
where
    I: IntoIterator<Item = &'a Message>,
{
    let mut children: HashMap<&MessageId, Vec<&MessageId>> = HashMap::new();
    for message in messages {
        if let Some(parent) = message.parent_id() {
            children.entry(parent).or_default().push(message.id());
        }
    }

    let mut collected = HashSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !collected.insert(id.clone()) {
            continue;
        }
        if let Some(kids) = children.get(id) {
            stack.extend(kids.iter().copied());
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn msg(id: &str, parent: Option<&str>) -> Message {
        Message::user(parent.map(MessageId::from), id).with_id(id)
    }

    #[test]
    fn collects_all_descendants_across_branches() {
        let messages = vec![
            msg("m1", None),
            msg("m2", Some("m1")),
            msg("m3", Some("m2")),
            msg("m4", Some("m2")),
            msg("m5", Some("m4")),
            msg("other", Some("m1")),
        ];

        let set = collect_subtree(&messages, &MessageId::from("m2"));
        let mut ids: Vec<_> = set.into_iter().map(|id| id.0).collect();
        ids.sort();
        assert_eq!(ids, vec!["m2", "m3", "m4", "m5"]);
    }

    #[test]
    fn deep_chain_does_not_recurse() {
        let mut messages = vec![msg("n0", None)];
        for i in 1..50_000 {
            let parent = format!("n{}", i - 1);
            messages.push(msg(&format!("n{i}"), Some(&parent)));
        }
        let set = collect_subtree(&messages, &MessageId::from("n0"));
        assert_eq!(set.len(), 50_000);
    }

    #[test]
    fn unknown_root_yields_only_itself() {
        let messages = vec![msg("m1", None)];
        let set = collect_subtree(&messages, &MessageId::from("ghost"));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&MessageId::from("ghost")));
    }

    fn arb_forest() -> impl Strategy<Value = Vec<Message>> {
        // Each node picks a parent among the nodes created before it, or none.
        proptest::collection::vec(proptest::option::of(any::<prop::sample::Index>()), 1..60)
            .prop_map(|parents| {
                let mut messages: Vec<Message> = Vec::new();
                for (i, parent) in parents.into_iter().enumerate() {
                    let parent_id = match parent {
                        Some(idx) if i > 0 => Some(messages[idx.index(i)].id.clone()),
                        _ => None,
                    };
                    messages.push(
                        Message::user(parent_id, "x").with_id(MessageId::from(format!("n{i}"))),
                    );
                }
                messages
            })
    }

    fn reaches(messages: &[Message], from: &MessageId, ancestor: &MessageId) -> bool {
        let by_id: HashMap<_, _> = messages.iter().map(|m| (m.id(), m)).collect();
        let mut current = Some(from);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = by_id.get(id).and_then(|m| m.parent_id());
        }
        false
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_subtree_is_exactly_the_descendant_closure(
            messages in arb_forest(),
            pick in any::<prop::sample::Index>(),
        ) {
            let root = messages[pick.index(messages.len())].id.clone();
            let set = collect_subtree(&messages, &root);

            for message in &messages {
                let expected = reaches(&messages, message.id(), &root);
                prop_assert_eq!(set.contains(message.id()), expected);
            }
        }
    }
}
