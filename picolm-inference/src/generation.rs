use crate::sampler::Sampler;
use crate::tokenizer::ByteTokenizer;
use crate::transformer::Model;
use anyhow::Result;
use log::info;
use std::io::{self, Write};
use std::time::Instant;

/// Feeds the prompt through the model, then samples autoregressively until
/// `max_new_tokens` or the context window runs out. Generated bytes stream to
/// stdout as they appear; the full generated text is also returned.
pub fn generate(
    model: &mut Model,
    tokenizer: &ByteTokenizer,
    sampler: &mut Sampler,
    prompt: &str,
    max_new_tokens: usize,
) -> Result<String> {
    let prompt_tokens = tokenizer.encode(prompt);
    if prompt_tokens.is_empty() {
        anyhow::bail!("prompt must not be empty");
    }

    let limit = model
        .config()
        .max_seq
        .min(prompt_tokens.len() + max_new_tokens);
    let mut output = String::new();
    let mut token = prompt_tokens[0];
    let mut generated = 0usize;
    let mut started = None;

    for pos in 0..limit {
        let logits = model.forward(token, pos)?;

        token = if pos + 1 < prompt_tokens.len() {
            prompt_tokens[pos + 1]
        } else {
            started.get_or_insert_with(Instant::now);
            generated += 1;
            let mut logits = logits.to_vec();
            sampler.sample(&mut logits)
        };

        if pos + 1 >= prompt_tokens.len() {
            let c = tokenizer.decode(token);
            output.push(c);
            print!("{c}");
            io::stdout().flush()?;
        }
    }
    println!();

    if let Some(started) = started {
        let secs = started.elapsed().as_secs_f64();
        if generated > 0 && secs > 0.0 {
            info!(
                "generated {generated} tokens in {secs:.2}s ({:.2} tok/s)",
                generated as f64 / secs
            );
        }
    }

    Ok(output)
}
