use clap::Args;
use serde_json::Value;

use qlik_core::QlikConfig;

#[derive(Args)]
pub struct AppsArgs {
    /// Maximum number of apps to list
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
}

#[derive(Args)]
pub struct AppArgs {
    /// App id (from `qlik apps`)
    pub app_id: String,
    /// Skip the reload/data metadata lookup
    #[arg(long)]
    pub skip_metadata: bool,
}

#[derive(Args)]
pub struct SpacesArgs {
    /// Maximum number of spaces to list
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
}

pub async fn list_apps(args: AppsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = QlikConfig::from_env()?;
    let body = get_json(
        &config,
        "/api/v1/items",
        &[
            ("resourceType", "app".to_string()),
            ("limit", args.limit.to_string()),
        ],
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn app_details(args: AppArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = QlikConfig::from_env()?;
    let app = get_json(&config, &format!("/api/v1/apps/{}", args.app_id), &[]).await?;
    let mut payload = serde_json::json!({ "app": app });
    if !args.skip_metadata {
        let metadata = get_json(
            &config,
            &format!("/api/v1/apps/{}/data/metadata", args.app_id),
            &[],
        )
        .await?;
        payload["metadata"] = metadata;
    }
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

pub async fn list_spaces(args: SpacesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = QlikConfig::from_env()?;
    let body = get_json(
        &config,
        "/api/v1/spaces",
        &[("limit", args.limit.to_string())],
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn get_json(
    config: &QlikConfig,
    path: &str,
    query: &[(&str, String)],
) -> Result<Value, Box<dyn std::error::Error>> {
    let Some(api_key) = &config.api_key else {
        return Err("QLIK_API_KEY is required for Cloud REST commands".into());
    };

    let client = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .danger_accept_invalid_certs(!config.verify_ssl)
        .build()?;

    let url = format!("{}{}", config.server_url.trim_end_matches('/'), path);
    let resp = client
        .get(&url)
        .query(query)
        .header("Authorization", format!("Bearer {api_key}"))
        .send()
        .await?;

    let status = resp.status();
    let body: Value = resp.json().await?;

    if !status.is_success() {
        eprintln!("{}", serde_json::to_string_pretty(&body)?);
        std::process::exit(1);
    }
    Ok(body)
}
