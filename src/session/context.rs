//! # Session Context
//!
//! A one-shot snapshot of ambient facts (date, time, where the user is, where the
//! hotel is) taken at the start of every connection attempt and folded into the
//! agent's system instruction.
//!
//! ## Location Lookup:
//! The user's position comes from a [`LocationProvider`]. Lookups are bounded by a
//! timeout and never fail the connection: any problem degrades to an explicit
//! "unknown" value carrying the reason.

use chrono::{DateTime, Local, TimeZone};
use futures_util::future::BoxFuture;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.5}, {:.5}", self.latitude, self.longitude)
    }
}

/// Why the user's position is not known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationUnavailable {
    Unsupported,
    PermissionDenied,
    Timeout,
}

impl fmt::Display for LocationUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationUnavailable::Unsupported => f.write_str("Not supported"),
            LocationUnavailable::PermissionDenied => f.write_str("Permission denied"),
            LocationUnavailable::Timeout => f.write_str("Timed out"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UserLocation {
    Known(Coordinates),
    Unknown(LocationUnavailable),
}

impl fmt::Display for UserLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserLocation::Known(coordinates) => write!(f, "{}", coordinates),
            UserLocation::Unknown(reason) => write!(f, "Unknown ({})", reason),
        }
    }
}

/// Source of the user's current position.
pub trait LocationProvider: Send + Sync {
    fn locate(&self) -> BoxFuture<'static, Result<Coordinates, LocationUnavailable>>;
}

/// A provider with a fixed answer, e.g. the position configured for a kiosk.
/// `None` reports that location is not supported on this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLocation(pub Option<Coordinates>);

impl LocationProvider for FixedLocation {
    fn locate(&self) -> BoxFuture<'static, Result<Coordinates, LocationUnavailable>> {
        let answer = self.0.ok_or(LocationUnavailable::Unsupported);
        Box::pin(async move { answer })
    }
}

/// Reference location used for routing questions.
#[derive(Debug, Clone, PartialEq)]
pub struct HotelLocation {
    pub name: String,
    pub address: String,
    pub coordinates: Coordinates,
}

impl Default for HotelLocation {
    fn default() -> Self {
        Self {
            name: "Hotel MKR".to_string(),
            address: "Marine Drive Road, Puri, Odisha".to_string(),
            coordinates: Coordinates::new(19.7984, 85.8249),
        }
    }
}

/// Immutable per-attempt snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub date: String,
    pub time: String,
    pub user_location: UserLocation,
    pub hotel: HotelLocation,
}

impl SessionContext {
    /// Query the provider (bounded by `timeout`) and stamp the local date and time.
    pub async fn gather(
        provider: &dyn LocationProvider,
        timeout: Duration,
        hotel: HotelLocation,
    ) -> Self {
        let user_location = match tokio::time::timeout(timeout, provider.locate()).await {
            Ok(Ok(coordinates)) => UserLocation::Known(coordinates),
            Ok(Err(reason)) => {
                tracing::info!("User location unavailable: {}", reason);
                UserLocation::Unknown(reason)
            }
            Err(_) => {
                tracing::warn!("User location lookup timed out after {:?}", timeout);
                UserLocation::Unknown(LocationUnavailable::Timeout)
            }
        };
        Self::at(&Local::now(), user_location, hotel)
    }

    /// Build a context for a fixed instant.
    pub fn at<Tz>(now: &DateTime<Tz>, user_location: UserLocation, hotel: HotelLocation) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        Self {
            date: now.format("%A, %-d %B %Y").to_string(),
            time: now.format("%I:%M %p").to_string(),
            user_location,
            hotel,
        }
    }

    /// Append the real-time context block to the base instruction.
    pub fn compose_instruction(&self, base: &str) -> String {
        let hotel = &self.hotel;
        format!(
            "{base}\n\n\
             **Real-time Session Context:**\n\
             - **Current Date:** {date}\n\
             - **Current Time:** {time}\n\
             - **Hotel Location:** {name}, {address} (Coordinates: {hotel_coords}).\n\
             - **User's Current Location (Lat, Long):** {user}\n\n\
             **Booking Validation Rules:**\n\
             - Never accept bookings for dates before the Current Date above.\n\
             - If a requested date is in the past, state today's date and ask for a future date.\n\n\
             **Location & Routing Instructions:**\n\
             - For distance or route questions, compare the user's coordinates with the hotel's coordinates ({hotel_coords}).\n\
             - If the user's location is Unknown, ask them to enable device location so you can guide them.\n",
            base = base.trim(),
            date = self.date,
            time = self.time,
            name = hotel.name,
            address = hotel.address,
            hotel_coords = format!(
                "{}, {}",
                hotel.coordinates.latitude, hotel.coordinates.longitude
            ),
            user = self.user_location,
        )
    }
}
