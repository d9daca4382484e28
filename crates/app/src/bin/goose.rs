use goose::prelude::*;
use rand::Rng;
use serde_json::json;

const TOOL_ENDPOINT: &str = "/v1/tools/code_interpreter/call";
const MAX_TERMS: usize = 12;

async fn setup_custom_client(user: &mut GooseUser) -> TransactionResult {
    use reqwest::Client;

    let builder = Client::builder().cookie_store(true).gzip(true);
    user.set_client_builder(builder).await?;
    Ok(())
}

/// A short program that prints the sum of random terms, plus that sum.
fn arithmetic_program() -> (String, i64) {
    let mut rng = rand::rng();
    let count = rng.random_range(2..=MAX_TERMS);
    let terms: Vec<i64> = (0..count).map(|_| rng.random_range(-10_000..10_000)).collect();
    let expected = terms.iter().sum();
    let listed: Vec<String> = terms.iter().map(i64::to_string).collect();
    let code = format!(
        "terms = [{}]\ntotal = 0\nfor t in terms:\n    total += t\nprint(total)",
        listed.join(", ")
    );
    (code, expected)
}

async fn code_roundtrip(user: &mut GooseUser) -> TransactionResult {
    let (code, expected) = arithmetic_program();
    let payload = json!({
        "params": { "code": code },
        "timeout_secs": 30,
    });
    let mut goose = user.post_json(TOOL_ENDPOINT, &payload).await?;
    let response = goose
        .response
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    if !status.is_success() {
        return user.set_failure(
            &format!("status {}", status.as_u16()),
            &mut goose.request,
            None,
            Some(&body),
        );
    }
    let parsed: serde_json::Value = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(_) => return user.set_failure("invalid json", &mut goose.request, None, Some(&body)),
    };
    let result = parsed.get("result").and_then(|value| value.as_str());
    match result {
        Some(text) if text.trim() == expected.to_string() => Ok(()),
        Some(_) => user.set_failure("wrong sum", &mut goose.request, None, Some(&body)),
        None => user.set_failure("missing result", &mut goose.request, None, Some(&body)),
    }
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("code_roundtrip")
                .register_transaction(transaction!(setup_custom_client).set_on_start())
                .register_transaction(transaction!(code_roundtrip)),
        )
        .execute()
        .await?;
    Ok(())
}
