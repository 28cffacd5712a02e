use tracing::{debug, info};

use crate::domain::errors::StoreResult;
use crate::domain::models::NewMessage;
use crate::domain::repositories::MessageStore;

pub async fn run(store: &dyn MessageStore, seed_samples: bool) -> StoreResult<()> {
    store.initialize().await?;
    info!("messages schema ready");

    if seed_samples {
        let inserted = store.seed_if_empty(sample_messages()).await?;
        if inserted > 0 {
            info!(inserted, "seeded sample messages");
        } else {
            debug!("messages already present, seed skipped");
        }
    }

    Ok(())
}

pub fn sample_messages() -> Vec<NewMessage> {
    vec![
        NewMessage {
            phone_number: "+905551111111".to_string(),
            content: "Test message 1 - dispatcher demo".to_string(),
        },
        NewMessage {
            phone_number: "+905552222222".to_string(),
            content: "Test message 2 - welcome aboard".to_string(),
        },
        NewMessage {
            phone_number: "+905553333333".to_string(),
            content: "Test message 3 - your order is ready".to_string(),
        },
        NewMessage {
            phone_number: "+905554444444".to_string(),
            content: "Test message 4 - thanks for shopping".to_string(),
        },
        NewMessage {
            phone_number: "+905555555555".to_string(),
            content: "Test message 5 - a discount just for you".to_string(),
        },
    ]
}
