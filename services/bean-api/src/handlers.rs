use crate::auth::{AdminUser, AuthenticatedUser, RequireAuth};
use crate::errors::{ApiError, Result};
use crate::metrics;
use crate::models::{
    AssignHarvestRequest, CreateGiftLinkRequest, CreateTokenRequest, GiftLinkInfo,
    HarvestRequest, HarvestSearchQuery, LeaderboardResponse, LimitQuery, RedeemGiftLinkRequest,
    TransferRequest, TransferResponse, UpdateWalletRequest, UserSearchQuery, VerifyResponse,
    WalletResponse,
};
use actix_web::{guard, web, HttpResponse};
use bean_ledger::{harvest::DEFAULT_PAGE_SIZE, types::SIGNUP_BONUS, Ledger};
use serde_json::json;
use tracing::{info, warn};
use validator::Validate;

const LEADERBOARD_SIZE: i64 = 50;
const DEFAULT_USER_SEARCH: i64 = 10;
const MAX_USER_SEARCH: i64 = 50;
const DEFAULT_RECENT_ENTRIES: i64 = 100;
const MAX_RECENT_ENTRIES: i64 = 1000;

fn clamp_limit(limit: Option<i64>, default: i64, max: i64) -> i64 {
    match limit {
        Some(limit) if limit > 0 => limit.min(max),
        _ => default,
    }
}

/// Health check endpoint
pub async fn health_check(ledger: web::Data<Ledger>) -> HttpResponse {
    match ledger.health_check().await {
        Ok(()) => HttpResponse::Ok().json(json!({
            "status": "healthy",
            "service": "bean-api",
            "version": env!("CARGO_PKG_VERSION")
        })),
        Err(e) => {
            warn!("Health check failed: {}", e);
            HttpResponse::ServiceUnavailable().json(json!({
                "status": "unhealthy",
                "service": "bean-api"
            }))
        }
    }
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "error": "Failed to gather metrics",
            "details": e.to_string()
        })),
    }
}

// ----------------------------------------------------------------------
// Public
// ----------------------------------------------------------------------

pub async fn total_supply(ledger: web::Data<Ledger>) -> Result<HttpResponse> {
    let total = ledger.total_supply().await?;
    Ok(HttpResponse::Ok().json(json!({ "total_beans": total })))
}

pub async fn leaderboard(ledger: web::Data<Ledger>) -> Result<HttpResponse> {
    let accounts = ledger.top_accounts(LEADERBOARD_SIZE).await?;
    Ok(HttpResponse::Ok().json(LeaderboardResponse::from_accounts(accounts)))
}

pub async fn search_harvests(
    ledger: web::Data<Ledger>,
    query: web::Query<HarvestSearchQuery>,
) -> Result<HttpResponse> {
    let page = ledger
        .search_harvests(
            &query.q,
            query.page.unwrap_or(1),
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

/// Gift link preview for the claim page
pub async fn get_gift_link(
    ledger: web::Data<Ledger>,
    code: web::Path<String>,
) -> Result<HttpResponse> {
    let link = ledger.get_gift_link_by_code(&code).await?;
    Ok(HttpResponse::Ok().json(GiftLinkInfo::from(&link)))
}

/// Check an export document against its embedded signature
pub async fn verify_export(ledger: web::Data<Ledger>, body: web::Bytes) -> Result<HttpResponse> {
    let signature = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|doc| doc.get("signature")?.as_str().map(str::to_string))
        .unwrap_or_default();

    let valid = ledger.verify_export(&body, &signature)?;
    if !valid {
        warn!("Export verification failed");
    }
    Ok(HttpResponse::Ok().json(VerifyResponse { valid }))
}

// ----------------------------------------------------------------------
// Wallet
// ----------------------------------------------------------------------

pub async fn get_wallet(
    ledger: web::Data<Ledger>,
    user: AuthenticatedUser,
) -> Result<HttpResponse> {
    let (account, created) = ledger.open_wallet(&user.username).await?;
    if created {
        metrics::record_mint("signup", SIGNUP_BONUS);
    }
    Ok(HttpResponse::Ok().json(WalletResponse::from(account)))
}

pub async fn get_history(
    ledger: web::Data<Ledger>,
    user: AuthenticatedUser,
) -> Result<HttpResponse> {
    let entries = ledger.get_history(&user.username).await?;
    Ok(HttpResponse::Ok().json(json!({
        "transactions": entries,
        "total": entries.len()
    })))
}

pub async fn transfer(
    ledger: web::Data<Ledger>,
    user: AuthenticatedUser,
    request: web::Json<TransferRequest>,
) -> Result<HttpResponse> {
    request.validate()?;
    let request = request.into_inner();

    let entry = match ledger
        .transfer(
            &user.username,
            &request.to_user,
            request.amount,
            request.force,
            request.note.as_deref(),
        )
        .await
    {
        Ok(entry) => {
            metrics::record_transfer("completed");
            entry
        }
        Err(e) => {
            metrics::record_transfer(e.kind());
            return Err(e.into());
        }
    };

    Ok(HttpResponse::Ok().json(TransferResponse {
        message: "transfer completed".to_string(),
        entry_id: entry.id,
        amount: entry.amount,
        to_user: entry.to_user,
    }))
}

/// Signed download of the caller's history
pub async fn export_history(
    ledger: web::Data<Ledger>,
    user: AuthenticatedUser,
) -> Result<HttpResponse> {
    let document = ledger.export_history(&user.username).await?;
    Ok(HttpResponse::Ok()
        .insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"beans-{}.json\"", document.username),
        ))
        .json(document))
}

pub async fn search_users(
    ledger: web::Data<Ledger>,
    _user: AuthenticatedUser,
    query: web::Query<UserSearchQuery>,
) -> Result<HttpResponse> {
    let limit = clamp_limit(query.limit, DEFAULT_USER_SEARCH, MAX_USER_SEARCH);
    let users: Vec<WalletResponse> = ledger
        .search_accounts(query.q.trim(), limit)
        .await?
        .into_iter()
        .map(WalletResponse::from)
        .collect();
    Ok(HttpResponse::Ok().json(json!({ "users": users })))
}

// ----------------------------------------------------------------------
// Tokens
// ----------------------------------------------------------------------

pub async fn create_token(
    ledger: web::Data<Ledger>,
    user: AuthenticatedUser,
    request: web::Json<CreateTokenRequest>,
) -> Result<HttpResponse> {
    request.validate()?;
    let issued = ledger.issue_token(&user.username, &request.expires_in).await?;
    metrics::TOKENS_ISSUED.inc();
    Ok(HttpResponse::Created().json(issued))
}

pub async fn list_tokens(
    ledger: web::Data<Ledger>,
    user: AuthenticatedUser,
) -> Result<HttpResponse> {
    let tokens = ledger.list_tokens(&user.username).await?;
    Ok(HttpResponse::Ok().json(json!({ "tokens": tokens })))
}

pub async fn delete_token(
    ledger: web::Data<Ledger>,
    user: AuthenticatedUser,
    id: web::Path<i64>,
) -> Result<HttpResponse> {
    ledger.delete_token(&user.username, *id).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ----------------------------------------------------------------------
// Gift links
// ----------------------------------------------------------------------

pub async fn create_gift_link(
    ledger: web::Data<Ledger>,
    user: AuthenticatedUser,
    request: web::Json<CreateGiftLinkRequest>,
) -> Result<HttpResponse> {
    request.validate()?;
    let link = ledger
        .create_gift_link(
            &user.username,
            request.amount,
            request.message.as_deref(),
            &request.expires_in,
        )
        .await?;
    metrics::record_gift_link("created");
    Ok(HttpResponse::Created().json(link))
}

pub async fn list_gift_links(
    ledger: web::Data<Ledger>,
    user: AuthenticatedUser,
) -> Result<HttpResponse> {
    let links = ledger.list_gift_links(&user.username).await?;
    Ok(HttpResponse::Ok().json(json!({ "gift_links": links })))
}

pub async fn redeem_gift_link(
    ledger: web::Data<Ledger>,
    user: AuthenticatedUser,
    request: web::Json<RedeemGiftLinkRequest>,
) -> Result<HttpResponse> {
    request.validate()?;
    let link = ledger.redeem_gift_link(&request.code, &user.username).await?;
    metrics::record_gift_link("redeemed");
    Ok(HttpResponse::Ok().json(json!({
        "message": "gift link redeemed",
        "amount": link.amount,
        "from_username": link.owner
    })))
}

pub async fn delete_gift_link(
    ledger: web::Data<Ledger>,
    user: AuthenticatedUser,
    id: web::Path<i64>,
) -> Result<HttpResponse> {
    ledger.delete_gift_link(*id, &user.username).await?;
    metrics::record_gift_link("deleted");
    Ok(HttpResponse::NoContent().finish())
}

// ----------------------------------------------------------------------
// Admin
// ----------------------------------------------------------------------

pub async fn recent_transactions(
    ledger: web::Data<Ledger>,
    _admin: AdminUser,
    query: web::Query<LimitQuery>,
) -> Result<HttpResponse> {
    let limit = clamp_limit(query.limit, DEFAULT_RECENT_ENTRIES, MAX_RECENT_ENTRIES);
    let entries = ledger.recent_entries(limit).await?;
    Ok(HttpResponse::Ok().json(json!({
        "transactions": entries,
        "total": entries.len()
    })))
}

pub async fn update_wallet(
    ledger: web::Data<Ledger>,
    admin: AdminUser,
    username: web::Path<String>,
    request: web::Json<UpdateWalletRequest>,
) -> Result<HttpResponse> {
    request.validate()?;
    let account = ledger.set_balance(&username, request.balance).await?;
    info!(
        "Admin {} set balance of {} to {}",
        admin.0.username, account.username, account.balance
    );
    Ok(HttpResponse::Ok().json(WalletResponse::from(account)))
}

pub async fn list_harvests(ledger: web::Data<Ledger>, _admin: AdminUser) -> Result<HttpResponse> {
    let harvests = ledger.list_harvests().await?;
    Ok(HttpResponse::Ok().json(json!({ "harvests": harvests })))
}

pub async fn create_harvest(
    ledger: web::Data<Ledger>,
    _admin: AdminUser,
    request: web::Json<HarvestRequest>,
) -> Result<HttpResponse> {
    request.validate()?;
    let harvest = ledger
        .create_harvest(&request.title, &request.description, request.reward)
        .await?;
    Ok(HttpResponse::Created().json(harvest))
}

pub async fn update_harvest(
    ledger: web::Data<Ledger>,
    _admin: AdminUser,
    id: web::Path<i64>,
    request: web::Json<HarvestRequest>,
) -> Result<HttpResponse> {
    request.validate()?;
    let harvest = ledger
        .update_harvest(*id, &request.title, &request.description, request.reward)
        .await?;
    Ok(HttpResponse::Ok().json(harvest))
}

pub async fn delete_harvest(
    ledger: web::Data<Ledger>,
    _admin: AdminUser,
    id: web::Path<i64>,
) -> Result<HttpResponse> {
    ledger.delete_harvest(*id).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn assign_harvest(
    ledger: web::Data<Ledger>,
    _admin: AdminUser,
    id: web::Path<i64>,
    request: web::Json<AssignHarvestRequest>,
) -> Result<HttpResponse> {
    request.validate()?;
    let user = request.user_ref()?;
    let harvest = ledger.assign_harvest(*id, &user).await?;
    Ok(HttpResponse::Ok().json(harvest))
}

pub async fn complete_harvest(
    ledger: web::Data<Ledger>,
    admin: AdminUser,
    id: web::Path<i64>,
) -> Result<HttpResponse> {
    let harvest = ledger.complete_harvest(*id).await?;
    metrics::HARVESTS_COMPLETED.inc();
    metrics::record_mint("harvest", harvest.reward);
    info!(
        "Admin {} completed harvest {} for {:?}",
        admin.0.username, harvest.id, harvest.assigned_user
    );
    Ok(HttpResponse::Ok().json(harvest))
}

/// JSON body errors share the API error envelope
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| ApiError::Validation(err.to_string()).into())
}

/// Configure routes; `auth` guards everything that is not public
pub fn configure_routes(cfg: &mut web::ServiceConfig, auth: RequireAuth) {
    cfg.route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(metrics_endpoint))
        .route("/api/v1/total", web::get().to(total_supply))
        .route("/api/v1/leaderboard", web::get().to(leaderboard))
        .route("/api/v1/harvests", web::get().to(search_harvests))
        .route("/api/v1/transactions/verify", web::post().to(verify_export))
        // GET only, so other methods on this path reach the authenticated scope
        .service(
            web::resource("/api/v1/gift-links/{code}")
                .guard(guard::Get())
                .route(web::get().to(get_gift_link)),
        )
        .service(
            web::scope("/api/v1")
                .wrap(auth)
                .route("/wallet", web::get().to(get_wallet))
                .route("/transactions", web::get().to(get_history))
                .route("/transactions/export", web::get().to(export_history))
                .route("/transfer", web::post().to(transfer))
                .route("/users/search", web::get().to(search_users))
                .route("/tokens", web::post().to(create_token))
                .route("/tokens", web::get().to(list_tokens))
                .route("/tokens/{id}", web::delete().to(delete_token))
                .route("/gift-links", web::post().to(create_gift_link))
                .route("/gift-links", web::get().to(list_gift_links))
                .route("/gift-links/redeem", web::post().to(redeem_gift_link))
                .route("/gift-links/{id}", web::delete().to(delete_gift_link))
                .service(
                    web::scope("/admin")
                        .route("/transactions", web::get().to(recent_transactions))
                        .route("/wallet/{username}", web::put().to(update_wallet))
                        .route("/harvests", web::get().to(list_harvests))
                        .route("/harvests", web::post().to(create_harvest))
                        .route("/harvests/{id}", web::put().to(update_harvest))
                        .route("/harvests/{id}", web::delete().to(delete_harvest))
                        .route("/harvests/{id}/assign", web::post().to(assign_harvest))
                        .route("/harvests/{id}/complete", web::post().to(complete_harvest)),
                ),
        );
}
