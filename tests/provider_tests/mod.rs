mod openai_chat_test;
mod registry_test;
