/// Wrap `text` so the agent produces a plan without touching anything.
pub fn plan_prompt(text: &str) -> String {
    format!(
        "You are in planning mode. Do not edit files, run commands that change \
         state, or create commits.\n\
         Read whatever you need, then reply with a numbered implementation plan: \
         the files to change, the order of the changes, risks, and open questions \
         for the user.\n\n\
         Request:\n{}",
        text.trim()
    )
}
