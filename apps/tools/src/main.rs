use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use media::{ImageOptimizer, UploadEvent};
use shared::{
    domain::{DocumentId, ListingKind, Role, UserId},
    protocol::Query,
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/bazaar.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
        role: String,
    },
    CreateProduct {
        title: String,
        price: f64,
        #[arg(long, default_value = "direct")]
        kind: String,
        #[arg(long)]
        doc_id: Option<String>,
    },
    ListCollection {
        collection: String,
    },
    MintReferral {
        user_id: i64,
    },
    /// Re-run the image optimize job against one stored object.
    Optimize {
        bucket: String,
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { username, role } => {
            let role = Role::parse(&role).ok_or_else(|| anyhow!("unknown role '{role}'"))?;
            let user_id = storage.create_user(&username, role).await?;
            println!("created user_id={}", user_id.0);
        }
        Command::CreateProduct {
            title,
            price,
            kind,
            doc_id,
        } => {
            let kind = match kind.as_str() {
                "auction" => ListingKind::Auction,
                _ => ListingKind::Direct,
            };
            let mut fields = serde_json::Map::new();
            fields.insert("title".to_string(), serde_json::json!(title));
            fields.insert("price".to_string(), serde_json::json!(price));
            fields.insert("kind".to_string(), serde_json::json!(kind.as_str()));
            let doc_id = storage
                .put_document("products", doc_id.map(DocumentId), &fields)
                .await?;
            println!("created products/{doc_id}");
        }
        Command::ListCollection { collection } => {
            let records = storage.run_query(&Query::collection(&collection)).await?;
            for record in records {
                println!(
                    "{}/{} {}",
                    collection,
                    record.id,
                    serde_json::Value::Object(record.fields)
                );
            }
        }
        Command::MintReferral { user_id } => {
            let code = server_api::mint_referral_code(UserId(user_id));
            println!("referral_code={code}");
        }
        Command::Optimize { bucket, path } => {
            let object = storage
                .get_media_object(&bucket, &path)
                .await?
                .ok_or_else(|| anyhow!("object {bucket}/{path} not found"))?;
            let event = UploadEvent {
                bucket,
                path,
                content_type: object.content_type.clone(),
                custom_metadata: object.custom_metadata.clone(),
            };
            let outcome = ImageOptimizer::new().process(&storage, &event).await;
            println!("optimize outcome: {outcome:?}");
        }
    }

    Ok(())
}
