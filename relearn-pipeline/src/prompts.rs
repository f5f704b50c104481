//! The prompt catalogue.
//!
//! The vision prompts drive the rolling description session; the Q&A system
//! prompt is instantiated once per prompt fragment, each fragment steering
//! the question mix toward a different zoom level.

/// First-turn instruction for the vision session.
pub const FIRST_TURN_PROMPT: &str = "Provided is a sequence of frames of a screen. \
Describe all the actions that are taken throughout the frames, without mentioning \
frames specifically. Please be as descriptive as possible about all the actions \
taken and changes that are made so that all the necessary context can be included \
in the description without sounding overbearing. Please be descriptive and \
explicit about the specific nuances in the context, including any relevant text \
present and UI elements that are present and deemed relevant to jot down, \
including actions and elements that don't explicitly impact the webpage, e.g. \
side UI elements, scrolling, text being highlighted by the user, tool tips, \
button presses/button state changes, etc. Please be as explicit and descriptive \
and verbose as possible about the current context. Just give the description \
without any other chatty text.";

/// Continuation instruction for every vision turn after the first.
pub const CONTINUATION_PROMPT: &str = "Here is a continuation of the previous \
sequence of actions, provided as a sequence of frames of a screen. Describe all \
the actions that are taken throughout the frames, without mentioning frames \
specifically. Please be as descriptive as possible about all the actions taken \
and changes that are made so that all the necessary context can be included in \
the description without sounding overbearing. Please be descriptive and explicit \
about the specific nuances in the context, including any relevant text present \
and UI elements that are present and deemed relevant to jot down, including \
actions and elements that don't explicitly impact the webpage, e.g. side UI \
elements, scrolling, text being highlighted by the user, tool tips, button \
presses/button state changes, etc. Please be as explicit and descriptive and \
verbose as possible about the current context. In your description, do not \
repeat information or nuances that have already been mentioned in previous \
turns. Only describe new actions or changes that have been taken since.";

/// Replaces the previous user turn once its response has been recorded, so
/// the retained history does not carry the image payloads.
pub const HISTORY_PLACEHOLDER: &str =
    "Please provide a description of the new actions taken since the previous turn.";

/// Question-mix fragments substituted into [qa_system_prompt], one variant
/// per fan-out column.
pub const PROMPT_FRAGMENTS: [&str; 3] = [
    "**Critical: mix zoom levels**\n\n\
    * Some questions should zoom in (micro-level: \"what command ran?\").\n\
    * Some questions should zoom out (macro-level: \"why are they building this at all?\").\n\
    * This mix is required.\n\n\
You must cover:\n\n\
   * **What happened** (step-by-step actions, in order).\n\
   * **Why it matters** (what is the purpose of those actions / what are they working toward).\n\
   * **Current status** (is it working? prototype? production-ready?).\n\
   * **Ownership / responsibility** (who is supposed to do what next, if visible).\n\
   * **Blockers / unanswered questions**.\n\
   * **Impact / next step** (what could happen next based on the work so far).\n\
   * **Risk / policy concerns** if any (privacy, security, etc.).\n\
   * **Summary** at the end as one of the questions, framed like \"What did <person> accomplish?\" (change the phrasing)",
    "**You must cover high level questions (e.g., What is <person> doing, What was \
person doing at <time>?, What did <person> accomplish at <time>?, How did <user> \
accomplish X?, What is a summary of what user did from <time> to <time>?, etc.)**",
    "**You must format the questions to be very specific and targeted. Generate a \
lot of specific questions about the work that was done. They do not need to be \
high-level or require any thinking (these are questions for recall). For example:\n\n\
   * At 11PM on Friday, October 24th, what did Eugene do after opening the spreadsheet?\n\
   * What time did Jonathan send a message to Eugene about an API key?\n\
   * What was the name of the file that Jonathan was working on after he closed the Google Doc at night on October 24th?\n\
   * ...\n\n\
   **You MUST generate at least 20 questions.**",
];

const QA_PROMPT_TEMPLATE: &str = r#"You are given an activity log describing what a single person did (the "user"). Your job is to act like a manager or close coworker who did NOT see those logs but wants to understand what happened.

You must do two things in your answer:

1. Write a set of questions that a manager or coworker would realistically ask about that work.
2. Write the answers to those questions based ONLY on the log, plus reasonable inference.

Style and content requirements (follow all of these):

1. **Perspective**

   * Treat the user in the logs as "the person" or by name if given (e.g. "Eugene").
   * You are NOT that person. You are summarizing and interpreting their work, like a status reviewer.

2. **Question format**

   * Each question should be a bolded header-style question, like:
     `### 1. What did Eugene do in Spotify around 11:40 PM?`
   * Then answer in normal text under it.
   * Write at least 12 questions unless the log is extremely tiny.

3. **Answer style**

   * Answers must sometimes be very concrete and specific:

     * Mention filenames, timestamps, button clicks, exact strings that appeared, commands that ran, etc.
   * Other answers must be high-level / interpretive:

     * Explain intent, motivation, impact, status, next steps, or risks.
   * Mix these two styles across the questions. Some answers should feel like status reporting to leadership. Some should feel like forensic playback.

4. **Inference rules**

   * You ARE allowed to infer reasonable intent from context.
   * You are NOT allowed to make up facts that conflict with the log.
   * If you infer something, state it plainly as inference with language like "This suggests...," "This implies...," "Most likely...," "We don't see evidence that...".
   * If the log doesn't contain the answer, say that clearly (e.g. "We don't see who else was collaborating on that doc.").

5. **Scope of questions**
{prompt_fragments}

6. **Voice**

   * Keep it confident and readable, not robotic.
   * Use plain language. You can say things like "This looks like..." or "Classic pattern here is...".
   * Do NOT use corporate buzzword soup. Avoid purple prose.
   * It should read like a thoughtful engineering manager doing a debrief at midnight.

7. **Timestamps and names**

   * Always anchor major actions to explicit timestamps or time ranges if they're in the log (e.g. "around 11:40 PM on Oct 24").
   * Mention file names, playlist names, section headers, etc. exactly as they appeared in the log.

8. **Don't do**

   * Don't list the raw events with bullets and stop. You MUST turn them into Q&A with analysis.
   * Don't speak in first person like "I did X" or "I think Y."
   * Don't invent people or tools that aren't in the log.
   * Don't assume success unless the log confirms it.

9. **Final deliverable structure**

   * Output should be a sequence of sections like:

     ```
     ### 1. [Question here?]
     [Answer paragraph(s).]

     ### 2. [Question here?]
     [Answer...]
     ```
   * No intro, no outro. Just start with question 1.

After these instructions, you will receive a log of activity. Use ONLY that log to generate your Q&A.

If a detail is not in the log, you MUST say you don't see it in the log."#;

/// Render the Q&A system prompt for one fragment of the catalogue.
pub fn qa_system_prompt(fragment: &str) -> String {
    QA_PROMPT_TEMPLATE.replace("{prompt_fragments}", fragment)
}

/// Per-model reasoning-effort knob for the Q&A fan-out.
pub fn reasoning_effort_for(model: &str) -> Option<&'static str> {
    if model.contains("openai") {
        Some("medium")
    } else if model.contains("qwen") {
        Some("default")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_substitutes_fragment() {
        let rendered = qa_system_prompt(PROMPT_FRAGMENTS[1]);
        assert!(!rendered.contains("{prompt_fragments}"));
        assert!(rendered.contains("You must cover high level questions"));
    }

    #[test]
    fn reasoning_effort_mapping() {
        assert_eq!(reasoning_effort_for("openai/gpt-oss-120b"), Some("medium"));
        assert_eq!(reasoning_effort_for("qwen/qwen3-32b"), Some("default"));
        assert_eq!(
            reasoning_effort_for("meta-llama/llama-4-maverick-17b-128e-instruct"),
            None
        );
    }
}
