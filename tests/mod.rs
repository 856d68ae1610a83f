mod support;

mod dispatch_tests;
