mod mpmc_stress_tests;
