//! Assertion helpers with readable failure messages

use std::fmt::Debug;

/// Assert that a Result is Ok and return the value
pub fn assert_ok<T, E: Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

/// Assert that a Result is Err and return the error
pub fn assert_err<T: Debug, E>(result: Result<T, E>) -> E {
    match result {
        Ok(value) => panic!("Expected Err, got Ok: {:?}", value),
        Err(e) => e,
    }
}

/// Assert that a value is within an inclusive range
pub fn assert_in_range<T: PartialOrd + Debug>(value: T, min: T, max: T) {
    if value < min || value > max {
        panic!("Value {:?} is not in range [{:?}, {:?}]", value, min, max);
    }
}
