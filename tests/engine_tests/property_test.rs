use proptest::prelude::*;
use scriptflow::{
    script::{ActionDef, Phase, Topic, VariableDeclaration},
    variable::{UpdateMode, VariableScope},
    Script, Session, SessionStatus,
};
use serde_json::json;
use std::collections::HashMap;

use crate::default_engine;

// true = say, false = think
type Shape = Vec<Vec<Vec<bool>>>;

fn build_script(shape: &Shape) -> Script {
    let mut counter = 0;
    let phases = shape
        .iter()
        .enumerate()
        .map(|(p, topics)| Phase {
            phase_id: format!("p{p}"),
            name: String::new(),
            topics: topics
                .iter()
                .enumerate()
                .map(|(t, actions)| Topic {
                    topic_id: format!("p{p}t{t}"),
                    name: String::new(),
                    actions: actions
                        .iter()
                        .map(|is_say| {
                            counter += 1;
                            let id = format!("a{counter}");
                            if *is_say {
                                let config = json!({"content": format!("line {counter}")});
                                ActionDef::new(id, "say", config.as_object().cloned().unwrap())
                            } else {
                                let config =
                                    json!({"outputs": {"log": counter, "last": counter}});
                                ActionDef::new(id, "think", config.as_object().cloned().unwrap())
                            }
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    Script {
        script_id: "generated".to_string(),
        name: String::new(),
        version: None,
        phases,
        variables: vec![
            VariableDeclaration::new("log", VariableScope::Session, UpdateMode::Append),
            VariableDeclaration::new("last", VariableScope::Global, UpdateMode::Overwrite),
        ],
        metadata: HashMap::new(),
    }
}

fn shape_strategy() -> impl Strategy<Value = Shape> {
    // 空のトピック・フェーズも生成する
    prop::collection::vec(
        prop::collection::vec(prop::collection::vec(any::<bool>(), 0..4), 0..3),
        1..4,
    )
    .prop_filter("at least one action", |shape| {
        shape.iter().flatten().any(|topic| !topic.is_empty())
    })
}

fn history_len(session: &Session) -> usize {
    session.variables.iter().map(|entry| entry.history.len()).sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_n_actions_complete_in_n_turns(shape in shape_strategy()) {
        let script = build_script(&shape);
        let total = script.total_actions();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let engine = default_engine();
        let mut session = Session::new("prop", &script).unwrap();

        let mut turns = 0;
        let mut last_history = history_len(&session);
        while session.status != SessionStatus::Completed {
            prop_assert!(turns < total, "more turns than actions");
            runtime
                .block_on(engine.advance(&mut session, &script, &[], None))
                .unwrap();
            turns += 1;

            let current = history_len(&session);
            prop_assert!(current >= last_history);
            last_history = current;
        }
        prop_assert_eq!(turns, total);
    }
}
