use crate::session::{ChatMessage, Role};

/// ChatML for a conversation: system turn, earlier user/assistant turns from
/// `history`, then the new user turn and an open assistant turn.
///
/// `system_prompt` falls back to `default_system` when absent or blank.
/// The rendering of a given history is stable, so consecutive turns of one
/// conversation share a token prefix with the KV cache.
pub fn format_chat(
    history: &[ChatMessage],
    prompt: &str,
    system_prompt: Option<&str>,
    default_system: &str,
) -> String {
    let system = system_prompt
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default_system);

    let history_len: usize = history.iter().map(|m| m.content.len() + 32).sum();
    let mut p = String::with_capacity(system.len() + prompt.len() + history_len + 96);
    push_turn(&mut p, "system", system);
    for message in history {
        match message.role {
            Role::User => push_turn(&mut p, "user", &message.content),
            Role::Assistant => push_turn(&mut p, "assistant", &message.content),
            // the system turn is always the one above
            Role::System => {}
        }
    }
    push_turn(&mut p, "user", prompt);
    p.push_str("<|im_start|>assistant\n");
    p
}

fn push_turn(p: &mut String, role: &str, content: &str) {
    p.push_str("<|im_start|>");
    p.push_str(role);
    p.push('\n');
    p.push_str(content);
    p.push_str("<|im_end|>\n");
}

/// Stop strings implied by the template; appended to the caller's list so
/// the model cannot run on into a fabricated next turn.
pub const TEMPLATE_STOP_STRINGS: &[&str] = &["<|im_end|>", "<|im_start|>"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chatml_layout() {
        let p = format_chat(&[], "Hello", Some("Be brief."), "unused");
        assert_eq!(
            p,
            "<|im_start|>system\nBe brief.<|im_end|>\n<|im_start|>user\nHello<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_blank_system_prompt_uses_default() {
        let p = format_chat(&[], "Hi", Some("   "), "You are a helpful AI assistant.");
        assert!(p.starts_with("<|im_start|>system\nYou are a helpful AI assistant.<|im_end|>"));
        let q = format_chat(&[], "Hi", None, "Default.");
        assert!(q.contains("system\nDefault.<|im_end|>"));
    }

    #[test]
    fn test_history_turns_precede_new_prompt() {
        let mut session = crate::session::ChatSession::new("/m.gguf", Default::default());
        session.push(Role::System, "ignored");
        session.push(Role::User, "Hi");
        session.push(Role::Assistant, "Hello!");

        let p = format_chat(&session.history, "How are you?", None, "sys");
        assert_eq!(
            p,
            "<|im_start|>system\nsys<|im_end|>\n\
             <|im_start|>user\nHi<|im_end|>\n\
             <|im_start|>assistant\nHello!<|im_end|>\n\
             <|im_start|>user\nHow are you?<|im_end|>\n\
             <|im_start|>assistant\n"
        );

        // The first turn's prompt is a prefix of the second's.
        assert!(p.starts_with(&format_chat(&[], "Hi", None, "sys")));
    }
}
