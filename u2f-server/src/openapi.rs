//! OpenAPI documentation configuration
//!
//! Generates OpenAPI 3.0 specification for the U2F ceremony API.

use utoipa::OpenApi;

use crate::handlers::{
    AttachDeviceRequest, DeviceSummary, FinishAuthenticationRequest, FinishAuthenticationResponse,
    FinishRegistrationRequest, FinishRegistrationResponse, HealthResponse, ReadyResponse,
    StartAuthenticationRequest, StartAuthenticationResponse, StartRegistrationRequest,
    StartRegistrationResponse,
};

/// U2F Server API - OpenAPI Documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "U2F Server",
        version = "0.1.0",
        description = r#"
## FIDO U2F Challenge-Response API

Relying-party endpoints for U2F security keys:

- **Registration** enrolls a token after checking its attestation signature
- **Authentication** issues one challenge per enrolled device and verifies
  the signed answer

### How It Works

1. `POST /u2f/authentication/start` returns `authenticateRequests` for `u2f.sign`
2. The browser relays the token's response to `POST /u2f/authentication/finish`
3. Every request can be finished once, before it expires
4. A signature counter that does not increase marks the device compromised;
   it is disabled and never challenged again

Errors carry a machine-readable `code` such as `SESSION_EXPIRED` or
`DEVICE_COMPROMISED`.
"#,
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development server")
    ),
    tags(
        (name = "Authentication", description = "Challenge enrolled devices and verify their signatures"),
        (name = "Registration", description = "Enroll new devices with attestation verification"),
        (name = "Health", description = "Service health and readiness endpoints")
    ),
    paths(
        crate::handlers::health::health,
        crate::handlers::health::ready,
        crate::handlers::authentication::start_authentication,
        crate::handlers::authentication::finish_authentication,
        crate::handlers::registration::start_registration,
        crate::handlers::registration::finish_registration,
        crate::handlers::registration::attach_device,
    ),
    components(
        schemas(
            HealthResponse,
            ReadyResponse,
            StartAuthenticationRequest,
            StartAuthenticationResponse,
            FinishAuthenticationRequest,
            FinishAuthenticationResponse,
            StartRegistrationRequest,
            StartRegistrationResponse,
            FinishRegistrationRequest,
            FinishRegistrationResponse,
            AttachDeviceRequest,
            DeviceSummary,
        )
    )
)]
pub struct ApiDoc;
