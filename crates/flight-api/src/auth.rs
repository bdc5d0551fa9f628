//! Bearer-token authentication for devices and observers
//!
//! Tokens are HS256 JWTs carrying `{userId, email?, droneId?, type, exp}`.
//! Device tokens ingest telemetry for one drone; user tokens observe and
//! manage the operator's own flights and zones.

use crate::error::ApiError;
use crate::state::AppState;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::RequestPartsExt;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use flight_core::{DroneId, OperatorId};
use flight_websocket::ObserverAuthenticator;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    User,
    Device,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drone_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub exp: usize,
}

pub struct JwtVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| ApiError::unauthorized("Invalid or expired token"))
    }

    /// Sign claims with the server secret
    pub fn issue(&self, claims: &Claims) -> Result<String, ApiError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| ApiError::internal(format!("token signing failed: {e}")))
    }
}

impl ObserverAuthenticator for JwtVerifier {
    fn authenticate(&self, token: &str) -> Result<OperatorId, String> {
        let claims = self.verify(token).map_err(|_| "Invalid or expired token".to_string())?;
        if claims.kind != TokenKind::User {
            return Err("Invalid token type".into());
        }
        Ok(OperatorId::new(claims.user_id))
    }
}

async fn bearer_claims(parts: &mut Parts, state: &AppState) -> Result<Claims, ApiError> {
    let TypedHeader(Authorization(bearer)) = parts
        .extract::<TypedHeader<Authorization<Bearer>>>()
        .await
        .map_err(|_| ApiError::unauthorized("Missing or invalid authorization header"))?;
    state.jwt.verify(bearer.token())
}

/// A drone authenticated by its device token
#[derive(Debug, Clone)]
pub struct DeviceAuth {
    pub operator_id: OperatorId,
    pub drone_id: DroneId,
}

impl FromRequestParts<AppState> for DeviceAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let claims = bearer_claims(parts, state).await?;
        if claims.kind != TokenKind::Device {
            return Err(ApiError::forbidden("Invalid token type"));
        }
        let drone_id = claims
            .drone_id
            .filter(|d| !d.is_empty())
            .ok_or_else(|| ApiError::unauthorized("Device token carries no drone"))?;

        Ok(Self {
            operator_id: OperatorId::new(claims.user_id),
            drone_id: DroneId::new(drone_id),
        })
    }
}

/// An operator authenticated by a user token
#[derive(Debug, Clone)]
pub struct ObserverAuth {
    pub operator_id: OperatorId,
}

impl FromRequestParts<AppState> for ObserverAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let claims = bearer_claims(parts, state).await?;
        if claims.kind != TokenKind::User {
            return Err(ApiError::forbidden("Invalid token type"));
        }
        Ok(Self {
            operator_id: OperatorId::new(claims.user_id),
        })
    }
}

#[cfg(test)]
pub(crate) fn claims(kind: TokenKind, user: &str, drone: Option<&str>) -> Claims {
    Claims {
        user_id: user.to_string(),
        email: None,
        drone_id: drone.map(str::to_string),
        kind,
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    }
}
