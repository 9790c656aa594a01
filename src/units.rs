//! Physical quantities with integer storage.
//!
//! Base units are chosen such that voltages are stored in millivolts, currents in milliamperes
//! and power in microwatts, which keeps every PD wire unit exact.
#![allow(missing_docs)]

ISQ!(uom::si, u32, (millimeter, kilogram, second, milliampere, kelvin, mole, candela));
