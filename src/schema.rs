//! Handwritten Diesel schema for the reading log.
//!
//! The migration defines the table. Integer columns are declared `BigInt`
//! because SQLite stores them as 64-bit values and the models use `i64`.

diesel::table! {
    sensor_data (id) {
        id -> BigInt,
        timestamp -> Text,
        temperature -> Double,
        humidity -> Double,
        noise -> BigInt,
        luminance -> BigInt,
    }
}
