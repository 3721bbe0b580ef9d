use pretty_assertions::assert_eq;
use scriptflow::{
    engine::visible_value,
    message::{Message, MessageRole},
    ExecutionPosition, ExecutionStatus, Session, SessionStatus,
};
use serde_json::json;

use crate::{default_engine, greeting_script};

#[tokio::test]
async fn test_greeting_scenario_turn_by_turn() {
    let engine = default_engine();
    let script = greeting_script();
    let mut session = Session::new("alice", &script).unwrap();
    let mut history: Vec<Message> = Vec::new();

    // Turn 1: say completes immediately
    let turn1 = engine.advance(&mut session, &script, &history, None).await.unwrap();
    assert_eq!(turn1.ai_message.as_deref(), Some("Hello"));
    assert_ne!(turn1.execution_status, ExecutionStatus::WaitingInput);
    assert_eq!(turn1.new_position, ExecutionPosition::new(0, 0, 1));
    history.extend(turn1.new_messages);

    // Turn 2: ask sends its prompt
    let turn2 = engine.advance(&mut session, &script, &history, None).await.unwrap();
    assert_eq!(turn2.execution_status, ExecutionStatus::WaitingInput);
    assert_eq!(turn2.ai_message.as_deref(), Some("What is your name?"));
    assert_eq!(turn2.new_position, ExecutionPosition::new(0, 0, 1));
    history.extend(turn2.new_messages);

    // Turn 3: the answer is extracted
    let turn3 = engine
        .advance(&mut session, &script, &history, Some("name: Alice"))
        .await
        .unwrap();
    assert_eq!(turn3.extracted_variables.get("name"), Some(&json!("Alice")));
    assert_eq!(turn3.execution_status, ExecutionStatus::Running);
    assert_eq!(turn3.new_position, ExecutionPosition::new(0, 0, 2));
    assert_eq!(turn3.new_messages.len(), 1);
    assert_eq!(turn3.new_messages[0].role, MessageRole::User);
    history.extend(turn3.new_messages);

    // Turn 4: think derives mood silently and the script ends
    let turn4 = engine.advance(&mut session, &script, &history, None).await.unwrap();
    assert_eq!(turn4.extracted_variables.get("mood"), Some(&json!("neutral")));
    assert_eq!(turn4.ai_message, None);
    assert_eq!(turn4.session_status, SessionStatus::Completed);
    assert!(turn4.new_messages.is_empty());

    let roles: Vec<MessageRole> = history.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![MessageRole::Assistant, MessageRole::Assistant, MessageRole::User]
    );
    assert_eq!(visible_value(&session, &script, "name"), Some(&json!("Alice")));
}

#[tokio::test]
async fn test_ask_reprompts_until_satisfied() {
    let engine = default_engine();
    let script = greeting_script();
    let mut session = Session::new("bob", &script).unwrap();

    engine.advance(&mut session, &script, &[], None).await.unwrap();
    let prompt = engine.advance(&mut session, &script, &[], None).await.unwrap();
    assert!(!prompt.extracted_variables.contains_key("name"));

    let retry = engine
        .advance(&mut session, &script, &[], Some("I'd rather not say"))
        .await
        .unwrap();
    assert_eq!(retry.execution_status, ExecutionStatus::WaitingInput);
    assert!(retry.ai_message.unwrap().contains("I still need: name"));
    // user input and the reprompt are both recorded
    assert_eq!(retry.new_messages.len(), 2);

    let done = engine
        .advance(&mut session, &script, &[], Some("fine, name: Bob"))
        .await
        .unwrap();
    assert_eq!(done.extracted_variables.get("name"), Some(&json!("Bob")));
    assert!(session.action_state.is_none());
}
