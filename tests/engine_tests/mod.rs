mod extension_test;
mod failure_test;
mod property_test;
mod scenario_test;
