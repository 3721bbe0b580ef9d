mod session_service_test;
